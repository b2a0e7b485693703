use chrono::Utc;
use clap::{Parser, ValueEnum};
use rewards_core::{JournalStorageConfig, RetryPolicy, RewardsEngine};
use rewards_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JournalStorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "rewardsd", version, about = "Contribution rewards REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8095
    #[arg(long, default_value = "127.0.0.1:8095", env = "REWARDS_LISTEN")]
    listen: SocketAddr,
    /// Journal persistence backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = JournalStorageMode::Auto, env = "REWARDS_JOURNAL_STORAGE")]
    journal_storage: JournalStorageMode,
    /// PostgreSQL url for the audit journal.
    #[arg(long, env = "REWARDS_JOURNAL_DATABASE_URL")]
    journal_database_url: Option<String>,
    #[arg(long, default_value_t = 5, env = "REWARDS_JOURNAL_PG_MAX_CONNECTIONS")]
    journal_pg_max_connections: u32,
    /// Unit attached to every suggested amount.
    #[arg(long, default_value = "ASA", env = "REWARDS_CURRENCY_UNIT")]
    currency_unit: String,
    /// Seconds between lifecycle ticks; 0 disables the ticker.
    #[arg(long, default_value_t = 30, env = "REWARDS_TICK_SECS")]
    tick_secs: u64,
    /// Handles never credited as contributors, comma separated.
    #[arg(long, value_delimiter = ',', env = "REWARDS_EXCLUDED_CONTRIBUTORS")]
    excluded_contributors: Vec<String>,
    /// Dispatch attempts before a cycle is reported as exhausted.
    #[arg(long, default_value_t = 5, env = "REWARDS_DISPATCH_MAX_ATTEMPTS")]
    dispatch_max_attempts: u32,
}

fn resolve_journal_storage(cli: &Cli) -> anyhow::Result<JournalStorageConfig> {
    let resolved_url = cli
        .journal_database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.journal_storage {
        JournalStorageMode::Memory => JournalStorageConfig::Memory,
        JournalStorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!(
                    "journal_storage=postgres requires --journal-database-url or DATABASE_URL"
                )
            })?;
            JournalStorageConfig::postgres(database_url, cli.journal_pg_max_connections)
        }
        JournalStorageMode::Auto => match resolved_url {
            Some(database_url) => {
                JournalStorageConfig::postgres(database_url, cli.journal_pg_max_connections)
            }
            None => JournalStorageConfig::Memory,
        },
    };

    Ok(storage)
}

async fn run_ticker(engine: Arc<RewardsEngine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match engine.tick(Utc::now()).await {
            Ok(report) => {
                if !report.locked.is_empty() || !report.closed.is_empty() {
                    info!(
                        locked = report.locked.len(),
                        closed = report.closed.len(),
                        "lifecycle tick advanced cycles"
                    );
                }
                for failure in report.failures {
                    warn!(failure = %failure, "lifecycle tick could not advance a cycle");
                }
            }
            Err(err) => warn!(error = %err, "lifecycle tick failed"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rewards_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let journal_storage = resolve_journal_storage(&cli)?;
    let config = ServiceConfig {
        journal_storage,
        currency_unit: cli.currency_unit.clone(),
        excluded_contributors: cli
            .excluded_contributors
            .iter()
            .map(|handle| handle.trim().to_string())
            .filter(|handle| !handle.is_empty())
            .collect(),
        dispatch_retry: RetryPolicy {
            max_attempts: cli.dispatch_max_attempts.max(1),
            ..RetryPolicy::default()
        },
    };
    let state = ServiceState::bootstrap(config).await?;
    let app = build_router(state.clone());

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("rewards-service REST listening on {}", listener.local_addr()?);

    let rest_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .map_err(anyhow::Error::from)
    });

    if cli.tick_secs == 0 {
        rest_task.await??;
        return Ok(());
    }

    let ticker = tokio::spawn(run_ticker(
        state.engine.clone(),
        Duration::from_secs(cli.tick_secs),
    ));
    tokio::select! {
        rest = rest_task => rest??,
        tick = ticker => tick?,
    }

    Ok(())
}
