use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::RewardsError;
use crate::types::{AllocationManifest, ClaimRecord, ClaimStatus, CycleId};

/// Bounded exponential backoff for outbound chain dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            multiplier: 2,
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Per-address transaction references returned by the chain collaborator.
/// An acknowledgment may cover only part of the dispatched manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchAck {
    pub tx_refs: BTreeMap<String, String>,
}

/// Outbound chain collaborator.
#[async_trait]
pub trait ChainDispatcher: Send + Sync {
    fn name(&self) -> &str;

    async fn dispatch_allocations(
        &self,
        cycle_id: &CycleId,
        manifest: &AllocationManifest,
    ) -> Result<DispatchAck, RewardsError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub attempts: u32,
    pub tx_refs: BTreeMap<String, String>,
}

/// Claim records per cycle, keyed by address. Records are updated, never deleted.
#[derive(Debug, Default)]
pub struct ClaimBook {
    records: DashMap<CycleId, BTreeMap<String, ClaimRecord>>,
}

impl ClaimBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending record for every manifest address that has none yet.
    pub fn seed(&self, manifest: &AllocationManifest) {
        let mut book = self.records.entry(manifest.cycle_id.clone()).or_default();
        for allocation in &manifest.allocations {
            book.entry(allocation.contributor_address.clone())
                .or_insert_with(|| ClaimRecord {
                    allocation_ref: format!(
                        "{}:{}",
                        manifest.cycle_id, allocation.contributor_address
                    ),
                    cycle_id: manifest.cycle_id.clone(),
                    address: allocation.contributor_address.clone(),
                    amount: allocation.total_amount,
                    tx_ref: None,
                    reclaim_tx_ref: None,
                    status: ClaimStatus::Pending,
                    attempts: 0,
                    last_error: None,
                    attempted_at: None,
                });
        }
    }

    pub fn records(&self, cycle_id: &CycleId) -> Vec<ClaimRecord> {
        self.records
            .get(cycle_id)
            .map(|book| book.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Addresses still lacking a chain acknowledgment.
    pub fn unacknowledged(&self, cycle_id: &CycleId) -> BTreeSet<String> {
        self.records
            .get(cycle_id)
            .map(|book| {
                book.values()
                    .filter(|record| {
                        matches!(record.status, ClaimStatus::Pending | ClaimStatus::Failed)
                    })
                    .map(|record| record.address.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_failures(&self, cycle_id: &CycleId) -> bool {
        self.records.get(cycle_id).map_or(false, |book| {
            book.values()
                .any(|record| record.status == ClaimStatus::Failed)
        })
    }

    pub fn all_settled(&self, cycle_id: &CycleId) -> bool {
        self.records.get(cycle_id).map_or(false, |book| {
            !book.is_empty() && book.values().all(|record| record.status.is_settled())
        })
    }

    fn record_attempt(
        &self,
        cycle_id: &CycleId,
        attempted: &BTreeSet<String>,
        acked: &BTreeMap<String, String>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let Some(mut book) = self.records.get_mut(cycle_id) else {
            return;
        };
        for address in attempted {
            let Some(record) = book.get_mut(address) else {
                continue;
            };
            record.attempts += 1;
            record.attempted_at = Some(now);
            match acked.get(address) {
                Some(tx_ref) => {
                    record.status = ClaimStatus::Dispatched;
                    record.tx_ref = Some(tx_ref.clone());
                    record.last_error = None;
                }
                None => {
                    record.last_error = Some(
                        error
                            .unwrap_or("address missing from acknowledgment")
                            .to_string(),
                    );
                }
            }
        }
    }

    fn mark_failed(&self, cycle_id: &CycleId, addresses: &BTreeSet<String>) {
        if let Some(mut book) = self.records.get_mut(cycle_id) {
            for address in addresses {
                if let Some(record) = book.get_mut(address) {
                    record.status = ClaimStatus::Failed;
                }
            }
        }
    }

    pub fn record_claim(
        &self,
        cycle_id: &CycleId,
        address: &str,
        tx_ref: &str,
    ) -> Result<ClaimRecord, RewardsError> {
        self.settle(cycle_id, address, |record| {
            record.status = ClaimStatus::Claimed;
            record.tx_ref = Some(tx_ref.to_string());
        })
    }

    pub fn record_reclaim(
        &self,
        cycle_id: &CycleId,
        address: &str,
        tx_ref: &str,
    ) -> Result<ClaimRecord, RewardsError> {
        self.settle(cycle_id, address, |record| {
            record.status = ClaimStatus::Reclaimed;
            record.reclaim_tx_ref = Some(tx_ref.to_string());
        })
    }

    fn settle(
        &self,
        cycle_id: &CycleId,
        address: &str,
        apply: impl FnOnce(&mut ClaimRecord),
    ) -> Result<ClaimRecord, RewardsError> {
        let mut book = self
            .records
            .get_mut(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))?;
        let record = book.get_mut(address).ok_or_else(|| {
            RewardsError::InvariantViolation(format!(
                "address {address} has no allocation in cycle {cycle_id}"
            ))
        })?;
        if record.status != ClaimStatus::Dispatched {
            return Err(RewardsError::InvariantViolation(format!(
                "claim record {} is {:?}, expected dispatched",
                record.allocation_ref, record.status
            )));
        }
        apply(record);
        Ok(record.clone())
    }
}

/// Dispatch every unacknowledged address of `manifest`, retrying per `policy`.
///
/// Each attempt sends only the addresses not yet acknowledged and is bounded by
/// `attempt_timeout`. After the last attempt the remaining records are marked failed.
pub async fn dispatch_with_retry(
    dispatcher: &dyn ChainDispatcher,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    manifest: &AllocationManifest,
    claims: &ClaimBook,
) -> Result<DispatchReport, RewardsError> {
    let cycle_id = &manifest.cycle_id;
    claims.seed(manifest);
    let mut tx_refs = BTreeMap::new();
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        let pending = claims.unacknowledged(cycle_id);
        if pending.is_empty() {
            return Ok(DispatchReport {
                attempts: attempt - 1,
                tx_refs,
            });
        }
        let batch = manifest.restricted_to(&pending);

        let outcome = tokio::time::timeout(
            attempt_timeout,
            dispatcher.dispatch_allocations(cycle_id, &batch),
        )
        .await;
        let now = Utc::now();
        match outcome {
            Ok(Ok(ack)) => {
                let acked: BTreeMap<String, String> = ack
                    .tx_refs
                    .into_iter()
                    .filter(|(address, _)| pending.contains(address))
                    .collect();
                claims.record_attempt(cycle_id, &pending, &acked, None, now);
                let missing = pending.len() - acked.len();
                tx_refs.extend(acked);
                if missing == 0 {
                    debug!(cycle_id = %cycle_id, attempt, dispatcher = dispatcher.name(), "dispatch fully acknowledged");
                    return Ok(DispatchReport {
                        attempts: attempt,
                        tx_refs,
                    });
                }
                last_error = format!("{missing} address(es) missing from acknowledgment");
            }
            Ok(Err(err)) => {
                last_error = err.to_string();
                claims.record_attempt(cycle_id, &pending, &BTreeMap::new(), Some(&last_error), now);
            }
            Err(_) => {
                last_error = format!("dispatch attempt timed out after {attempt_timeout:?}");
                claims.record_attempt(cycle_id, &pending, &BTreeMap::new(), Some(&last_error), now);
            }
        }

        warn!(
            cycle_id = %cycle_id,
            attempt,
            max_attempts,
            error = %last_error,
            "chain dispatch attempt failed"
        );
        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff_for(attempt)).await;
        }
    }

    let remaining = claims.unacknowledged(cycle_id);
    if remaining.is_empty() {
        return Ok(DispatchReport {
            attempts: max_attempts,
            tx_refs,
        });
    }
    claims.mark_failed(cycle_id, &remaining);
    Err(RewardsError::DispatchFailure {
        attempts: max_attempts,
        message: last_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Allocation;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manifest(addresses: &[(&str, u64)]) -> AllocationManifest {
        let cycle_id = CycleId::from("c1");
        AllocationManifest {
            cycle_id: cycle_id.clone(),
            currency_unit: "ASA".to_string(),
            allocations: addresses
                .iter()
                .map(|(address, amount)| Allocation {
                    cycle_id: cycle_id.clone(),
                    contributor_address: address.to_string(),
                    total_amount: *amount,
                    contributing_set: BTreeSet::new(),
                })
                .collect(),
            conflicts: Vec::new(),
            unallocated: Vec::new(),
            total_amount: addresses.iter().map(|(_, amount)| amount).sum(),
            manifest_hash: "h".to_string(),
            created_at: Utc::now(),
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2,
            max_backoff: Duration::from_millis(4),
        }
    }

    /// Acknowledges one address per call.
    struct OneAtATime {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChainDispatcher for OneAtATime {
        fn name(&self) -> &str {
            "one-at-a-time"
        }

        async fn dispatch_allocations(
            &self,
            _cycle_id: &CycleId,
            manifest: &AllocationManifest,
        ) -> Result<DispatchAck, RewardsError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut ack = DispatchAck::default();
            if let Some(allocation) = manifest.allocations.first() {
                ack.tx_refs.insert(
                    allocation.contributor_address.clone(),
                    format!("tx-{call}"),
                );
            }
            Ok(ack)
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ChainDispatcher for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn dispatch_allocations(
            &self,
            _cycle_id: &CycleId,
            _manifest: &AllocationManifest,
        ) -> Result<DispatchAck, RewardsError> {
            Err(RewardsError::DispatchFailure {
                attempts: 1,
                message: "node unavailable".to_string(),
            })
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn partial_acks_retry_only_missing_addresses() {
        let manifest = manifest(&[("A", 10), ("B", 20), ("C", 30)]);
        let claims = ClaimBook::new();
        let dispatcher = OneAtATime {
            calls: AtomicU32::new(0),
        };

        let report = dispatch_with_retry(
            &dispatcher,
            &fast_policy(5),
            Duration::from_secs(1),
            &manifest,
            &claims,
        )
        .await
        .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.tx_refs.len(), 3);
        assert!(claims.unacknowledged(&manifest.cycle_id).is_empty());
        let records = claims.records(&manifest.cycle_id);
        assert!(records.iter().all(|r| r.status == ClaimStatus::Dispatched));
        assert_eq!(records.iter().find(|r| r.address == "C").unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn exhaustion_marks_records_failed() {
        let manifest = manifest(&[("A", 10)]);
        let claims = ClaimBook::new();
        let err = dispatch_with_retry(
            &Unreachable,
            &fast_policy(3),
            Duration::from_secs(1),
            &manifest,
            &claims,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, RewardsError::DispatchFailure { attempts: 3, .. }));
        let record = &claims.records(&manifest.cycle_id)[0];
        assert_eq!(record.status, ClaimStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert!(record.last_error.as_deref().unwrap().contains("node unavailable"));
        assert!(claims.has_failures(&manifest.cycle_id));
    }

    #[tokio::test]
    async fn claims_require_dispatch_first() {
        let manifest = manifest(&[("A", 10)]);
        let claims = ClaimBook::new();
        claims.seed(&manifest);
        assert!(claims.record_claim(&manifest.cycle_id, "A", "tx").is_err());

        dispatch_with_retry(
            &OneAtATime {
                calls: AtomicU32::new(0),
            },
            &fast_policy(1),
            Duration::from_secs(1),
            &manifest,
            &claims,
        )
        .await
        .unwrap();
        let record = claims.record_claim(&manifest.cycle_id, "A", "claim-tx").unwrap();
        assert_eq!(record.status, ClaimStatus::Claimed);
        assert!(claims.all_settled(&manifest.cycle_id));
        assert!(claims.record_reclaim(&manifest.cycle_id, "A", "r").is_err());
    }
}
