#![deny(unsafe_code)]

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use rewards_adapters::MockChainDispatcher;
use rewards_core::{
    AdmissionReceipt, AllocationManifest, ChainDispatcher, ClaimRecord, ContributorId, Cycle,
    CycleId, CycleWindow, DispatchReport, EngineConfig, Handle, IdentityRegistry, JournalEntry,
    JournalEntryKind, JournalQuery, JournalStorageConfig, ManifestWrite, Platform, ProviderKind,
    ResolvedContribution, RetryPolicy, RewardsEngine, RewardsError, SubmitRawEvent,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub journal_storage: JournalStorageConfig,
    pub currency_unit: String,
    pub excluded_contributors: BTreeSet<String>,
    pub dispatch_retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            journal_storage: engine.journal_storage,
            currency_unit: engine.currency_unit,
            excluded_contributors: engine.excluded_contributors,
            dispatch_retry: engine.dispatch_retry,
        }
    }
}

#[derive(Clone)]
pub struct ServiceState {
    pub engine: Arc<RewardsEngine>,
    pub identities: Arc<IdentityRegistry>,
}

impl ServiceState {
    pub async fn bootstrap(config: ServiceConfig) -> Result<Self, ServiceError> {
        Self::bootstrap_with(config, Arc::new(MockChainDispatcher)).await
    }

    pub async fn bootstrap_with(
        config: ServiceConfig,
        dispatcher: Arc<dyn ChainDispatcher>,
    ) -> Result<Self, ServiceError> {
        let ServiceConfig {
            journal_storage,
            currency_unit,
            excluded_contributors,
            dispatch_retry,
        } = config;
        let engine_config = EngineConfig {
            journal_storage,
            currency_unit,
            excluded_contributors,
            dispatch_retry,
            ..EngineConfig::default()
        };
        let identities = Arc::new(IdentityRegistry::new());
        let engine = RewardsEngine::bootstrap(engine_config, identities.clone(), dispatcher).await?;

        Ok(Self {
            engine: Arc::new(engine),
            identities,
        })
    }
}

pub fn build_router(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/events", post(submit_event))
        .route("/v1/webhooks/:provider", post(submit_webhook))
        .route("/v1/identities/links", post(link_identity))
        .route("/v1/cycles", get(list_cycles).post(open_cycle))
        .route("/v1/cycles/:cycle_id", get(get_cycle))
        .route("/v1/cycles/:cycle_id/lock", post(lock_cycle))
        .route("/v1/cycles/:cycle_id/allocate", post(allocate_cycle))
        .route("/v1/cycles/:cycle_id/dispatch", post(dispatch_cycle))
        .route("/v1/cycles/:cycle_id/dispatch/retry", post(retry_dispatch))
        .route("/v1/cycles/:cycle_id/unblock", post(unblock_cycle))
        .route("/v1/cycles/:cycle_id/claim-window", post(open_claim_window))
        .route("/v1/cycles/:cycle_id/claims", get(list_claims).post(record_claim))
        .route("/v1/cycles/:cycle_id/manifest", get(get_manifest))
        .route("/v1/cycles/:cycle_id/contributions", get(list_contributions))
        .route("/v1/journal/entries", get(list_journal_entries))
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("core engine error: {0}")]
    Core(#[from] RewardsError),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Http { status: StatusCode, message: String },
    #[error(transparent)]
    Core(#[from] RewardsError),
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::Http {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

fn core_status(err: &RewardsError) -> StatusCode {
    match err {
        RewardsError::MalformedPayload { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        RewardsError::CycleNotFound(_) => StatusCode::NOT_FOUND,
        RewardsError::DuplicateEvent(_)
        | RewardsError::IdentityConflict(_)
        | RewardsError::CycleBlocked { .. }
        | RewardsError::EmptyCycle(_)
        | RewardsError::InvariantViolation(_) => StatusCode::CONFLICT,
        RewardsError::Identity(_) => StatusCode::BAD_REQUEST,
        RewardsError::DispatchFailure { .. } => StatusCode::BAD_GATEWAY,
        RewardsError::Journal(_) | RewardsError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Http { status, message } => {
                (status, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Core(err) => {
                let body = match &err {
                    RewardsError::IdentityConflict(conflicts) => serde_json::json!({
                        "error": err.to_string(),
                        "conflicts": conflicts,
                    }),
                    _ => serde_json::json!({ "error": err.to_string() }),
                };
                (core_status(&err), Json(body)).into_response()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    journal_backend: &'static str,
    journal_intact: bool,
}

async fn health(State(state): State<ServiceState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "rewards-service",
        journal_backend: state.engine.journal_backend().await,
        journal_intact: state.engine.verify_journal().await,
    })
}

async fn submit_event(
    State(state): State<ServiceState>,
    Json(submission): Json<SubmitRawEvent>,
) -> Result<Json<AdmissionReceipt>, ApiError> {
    Ok(Json(state.engine.submit_raw_event(&submission).await?))
}

async fn submit_webhook(
    Path(provider): Path<String>,
    State(state): State<ServiceState>,
    Json(payload): Json<Value>,
) -> Result<Json<AdmissionReceipt>, ApiError> {
    let provider = ProviderKind::parse(&provider).ok_or_else(|| {
        ApiError::not_found(format!("unknown provider '{provider}'"))
    })?;
    Ok(Json(
        state
            .engine
            .submit_provider_payload(provider, &payload, Utc::now())
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct LinkRequest {
    platform: Platform,
    handle: String,
    contributor_id: String,
    address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LinkResponse {
    handle: Handle,
    contributor_id: ContributorId,
}

async fn link_identity(
    State(state): State<ServiceState>,
    Json(request): Json<LinkRequest>,
) -> Result<Json<LinkResponse>, ApiError> {
    if request.handle.trim().is_empty() || request.contributor_id.trim().is_empty() {
        return Err(ApiError::bad_request("handle and contributor_id are required"));
    }
    let handle = Handle::new(request.platform, request.handle.as_str());
    let contributor_id = ContributorId::from(request.contributor_id.trim());
    state.identities.link(handle.clone(), contributor_id.clone());
    if let Some(address) = request.address.as_deref() {
        state.identities.claim_address(&contributor_id, address)?;
    }
    info!(handle = %handle, contributor_id = %contributor_id, "identity linked");
    Ok(Json(LinkResponse {
        handle,
        contributor_id,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct OpenCycleRequest {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn open_cycle(
    State(state): State<ServiceState>,
    Json(request): Json<OpenCycleRequest>,
) -> Result<Json<Cycle>, ApiError> {
    if request.start >= request.end {
        return Err(ApiError::bad_request("cycle start must be before end"));
    }
    Ok(Json(
        state
            .engine
            .open_cycle(CycleWindow::new(request.start, request.end))
            .await?,
    ))
}

#[derive(Debug, Clone, Serialize)]
struct CycleListResponse {
    items: Vec<Cycle>,
}

async fn list_cycles(
    State(state): State<ServiceState>,
) -> Result<Json<CycleListResponse>, ApiError> {
    Ok(Json(CycleListResponse {
        items: state.engine.cycles()?,
    }))
}

async fn get_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Cycle>, ApiError> {
    Ok(Json(state.engine.cycle(&CycleId::from(cycle_id))?))
}

async fn lock_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<Cycle>, ApiError> {
    Ok(Json(state.engine.lock_cycle(&CycleId::from(cycle_id)).await?))
}

#[derive(Debug, Clone, Serialize)]
struct AllocateResponse {
    outcome: &'static str,
    manifest: AllocationManifest,
}

async fn allocate_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AllocateResponse>, ApiError> {
    let write = state.engine.allocate(&CycleId::from(cycle_id)).await?;
    let outcome = match write {
        ManifestWrite::Stored(_) => "stored",
        ManifestWrite::AlreadyAllocated(_) => "already_allocated",
    };
    Ok(Json(AllocateResponse {
        outcome,
        manifest: write.into_manifest(),
    }))
}

async fn dispatch_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(state.engine.dispatch(&CycleId::from(cycle_id)).await?))
}

async fn retry_dispatch(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<DispatchReport>, ApiError> {
    Ok(Json(
        state
            .engine
            .retry_failed_dispatch(&CycleId::from(cycle_id))
            .await?,
    ))
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UnblockRequest {
    #[serde(default)]
    resolutions: BTreeMap<String, String>,
}

async fn unblock_cycle(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<UnblockRequest>,
) -> Result<Json<Cycle>, ApiError> {
    let resolutions = request
        .resolutions
        .into_iter()
        .map(|(contributor, address)| (ContributorId::from(contributor), address))
        .collect();
    Ok(Json(
        state
            .engine
            .force_unblock(&CycleId::from(cycle_id), resolutions)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ClaimWindowRequest {
    closes_at: DateTime<Utc>,
}

async fn open_claim_window(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ClaimWindowRequest>,
) -> Result<Json<Cycle>, ApiError> {
    Ok(Json(
        state
            .engine
            .open_claim_window(&CycleId::from(cycle_id), request.closes_at)
            .await?,
    ))
}

#[derive(Debug, Clone, Deserialize)]
struct ClaimRequest {
    address: String,
    tx_ref: String,
    #[serde(default)]
    reclaim: bool,
}

async fn record_claim(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
    Json(request): Json<ClaimRequest>,
) -> Result<Json<ClaimRecord>, ApiError> {
    let cycle_id = CycleId::from(cycle_id);
    let record = if request.reclaim {
        state
            .engine
            .record_reclaim(&cycle_id, &request.address, &request.tx_ref)
            .await?
    } else {
        state
            .engine
            .record_claim(&cycle_id, &request.address, &request.tx_ref)
            .await?
    };
    Ok(Json(record))
}

#[derive(Debug, Clone, Serialize)]
struct ClaimListResponse {
    items: Vec<ClaimRecord>,
}

async fn list_claims(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ClaimListResponse>, ApiError> {
    let cycle_id = CycleId::from(cycle_id);
    state.engine.cycle(&cycle_id)?;
    Ok(Json(ClaimListResponse {
        items: state.engine.claims(&cycle_id),
    }))
}

async fn get_manifest(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<AllocationManifest>, ApiError> {
    let cycle_id = CycleId::from(cycle_id);
    state
        .engine
        .manifest(&cycle_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("cycle '{cycle_id}' has no manifest")))
}

#[derive(Debug, Clone, Serialize)]
struct ContributionListResponse {
    total: usize,
    items: Vec<ResolvedContribution>,
}

async fn list_contributions(
    Path(cycle_id): Path<String>,
    State(state): State<ServiceState>,
) -> Result<Json<ContributionListResponse>, ApiError> {
    let cycle_id = CycleId::from(cycle_id);
    state.engine.cycle(&cycle_id)?;
    let items = state.engine.contributions(&cycle_id);
    Ok(Json(ContributionListResponse {
        total: items.len(),
        items,
    }))
}

#[derive(Debug, Clone, Deserialize)]
struct JournalEntriesQuery {
    kind: Option<String>,
    cycle_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct JournalEntriesResponse {
    backend: &'static str,
    returned: usize,
    items: Vec<JournalEntry>,
}

fn parse_kind_filter(kind: Option<&str>) -> Result<Option<JournalEntryKind>, ApiError> {
    match kind.map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(value) => JournalEntryKind::parse(&value).map(Some).map_err(|_| {
            let expected: Vec<&str> = JournalEntryKind::ALL
                .iter()
                .map(|kind| kind.as_str())
                .collect();
            ApiError::bad_request(format!(
                "invalid kind '{}'; expected one of: {}",
                value,
                expected.join(", ")
            ))
        }),
    }
}

async fn list_journal_entries(
    State(state): State<ServiceState>,
    Query(query): Query<JournalEntriesQuery>,
) -> Result<Json<JournalEntriesResponse>, ApiError> {
    let filter = JournalQuery {
        kind: parse_kind_filter(query.kind.as_deref())?,
        cycle_id: query.cycle_id.map(CycleId::from),
        limit: Some(query.limit.unwrap_or(100).min(1000)),
    };
    let items = state.engine.journal_entries(&filter).await;

    Ok(Json(JournalEntriesResponse {
        backend: state.engine.journal_backend().await,
        returned: items.len(),
        items,
    }))
}
