#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rewards_core::{
    AllocationManifest, ChainDispatcher, ContributorId, CycleId, CycleWindow, DispatchAck,
    EngineConfig, EventKind, Handle, IdentityRegistry, Platform, ProviderKind, RetryPolicy,
    RewardsEngine, RewardsError, SubmitRawEvent,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Acknowledges every address it is sent and remembers each call.
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ChainDispatcher for RecordingDispatcher {
    fn name(&self) -> &str {
        "recording"
    }

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        let addresses: Vec<String> = manifest.addresses().into_iter().collect();
        self.calls
            .lock()
            .map_err(|_| RewardsError::InvariantViolation("poisoned".to_string()))?
            .push(addresses.clone());
        Ok(DispatchAck {
            tx_refs: addresses
                .into_iter()
                .map(|address| {
                    let tx = format!("tx-{cycle_id}-{address}");
                    (address, tx)
                })
                .collect(),
        })
    }
}

/// Fails the first `failures` calls, then acknowledges everything.
#[derive(Debug)]
pub struct FailingThenOk {
    pub failures: u32,
    pub calls: AtomicU32,
}

#[async_trait]
impl ChainDispatcher for FailingThenOk {
    fn name(&self) -> &str {
        "failing-then-ok"
    }

    async fn dispatch_allocations(
        &self,
        _cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RewardsError::Serialization("chain node unavailable".to_string()));
        }
        Ok(DispatchAck {
            tx_refs: manifest
                .addresses()
                .into_iter()
                .map(|address| (address.clone(), format!("tx-{address}")))
                .collect(),
        })
    }
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        lock_barrier_timeout: std::time::Duration::from_millis(500),
        dispatch_retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(1),
            multiplier: 2,
            max_backoff: std::time::Duration::from_millis(4),
        },
        dispatch_timeout: std::time::Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

pub async fn engine_with(
    registry: Arc<IdentityRegistry>,
    dispatcher: Arc<dyn ChainDispatcher>,
) -> RewardsEngine {
    RewardsEngine::bootstrap(fast_config(), registry, dispatcher)
        .await
        .unwrap()
}

pub fn window_around(now: DateTime<Utc>) -> CycleWindow {
    CycleWindow::new(now - Duration::hours(1), now + Duration::hours(1))
}

/// Link `name` on `platform` to contributor `name` with one claimed address.
pub fn link(registry: &IdentityRegistry, platform: Platform, name: &str, address: &str) {
    let contributor = ContributorId::from(name);
    registry.link(Handle::new(platform, name), contributor.clone());
    registry.claim_address(&contributor, address).unwrap();
}

pub fn suggestion(
    provider: ProviderKind,
    external_id: &str,
    suggester: &str,
    payload: Value,
    received_at: DateTime<Utc>,
) -> SubmitRawEvent {
    SubmitRawEvent {
        provider,
        external_id: external_id.to_string(),
        author_identity: suggester.to_string(),
        kind: EventKind::Suggestion,
        payload,
        received_at,
    }
}
