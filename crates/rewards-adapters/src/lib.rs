//! Chain-dispatch adapters for the rewards engine.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use rewards_core::{AllocationManifest, ChainDispatcher, CycleId, DispatchAck, RewardsError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn tx_ref(prefix: &str, cycle_id: &CycleId, address: &str, amount: u64) -> String {
    let digest = blake3::hash(format!("{cycle_id}|{address}|{amount}").as_bytes());
    let short: String = digest.to_hex().chars().take(16).collect();
    format!("{prefix}-{short}")
}

fn ack_all(prefix: &str, cycle_id: &CycleId, manifest: &AllocationManifest) -> DispatchAck {
    DispatchAck {
        tx_refs: manifest
            .allocations
            .iter()
            .map(|allocation| {
                (
                    allocation.contributor_address.clone(),
                    tx_ref(
                        prefix,
                        cycle_id,
                        &allocation.contributor_address,
                        allocation.total_amount,
                    ),
                )
            })
            .collect(),
    }
}

/// Mock chain dispatcher that acknowledges every address with a deterministic tx ref.
#[derive(Debug, Clone, Default)]
pub struct MockChainDispatcher;

#[async_trait]
impl ChainDispatcher for MockChainDispatcher {
    fn name(&self) -> &str {
        "mock-chain"
    }

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        Ok(ack_all("chain", cycle_id, manifest))
    }
}

/// Acknowledges at most `per_call` addresses per call, in address order.
#[derive(Debug, Clone)]
pub struct PartialAckDispatcher {
    per_call: usize,
}

impl PartialAckDispatcher {
    pub fn new(per_call: usize) -> Self {
        Self {
            per_call: per_call.max(1),
        }
    }
}

#[async_trait]
impl ChainDispatcher for PartialAckDispatcher {
    fn name(&self) -> &str {
        "partial-ack"
    }

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        let tx_refs: BTreeMap<String, String> = ack_all("partial", cycle_id, manifest)
            .tx_refs
            .into_iter()
            .take(self.per_call)
            .collect();
        Ok(DispatchAck { tx_refs })
    }
}

/// Fails the first `failures` calls, then behaves like [`MockChainDispatcher`].
#[derive(Debug)]
pub struct FlakyDispatcher {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyDispatcher {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainDispatcher for FlakyDispatcher {
    fn name(&self) -> &str {
        "flaky-chain"
    }

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RewardsError::DispatchFailure {
                attempts: call + 1,
                message: format!("node rejected batch at {}", Utc::now().to_rfc3339()),
            });
        }
        Ok(ack_all("chain", cycle_id, manifest))
    }
}

/// Sleeps before acknowledging; drives the per-attempt timeout.
#[derive(Debug, Clone)]
pub struct StalledDispatcher {
    delay: Duration,
}

impl StalledDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ChainDispatcher for StalledDispatcher {
    fn name(&self) -> &str {
        "stalled-chain"
    }

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        tokio::time::sleep(self.delay).await;
        Ok(ack_all("chain", cycle_id, manifest))
    }
}

/// Deterministic failing dispatcher useful for chaos testing.
#[derive(Debug, Clone)]
pub struct AlwaysFailDispatcher {
    name: &'static str,
    reason: String,
}

impl AlwaysFailDispatcher {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ChainDispatcher for AlwaysFailDispatcher {
    fn name(&self) -> &str {
        self.name
    }

    async fn dispatch_allocations(
        &self,
        _cycle_id: &CycleId,
        _manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError> {
        Err(RewardsError::DispatchFailure {
            attempts: 1,
            message: self.reason.clone(),
        })
    }
}
