use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, warn};

use crate::aggregator::{ContributionAggregator, InFlightGuard, ResolvedContribution};
use crate::config::EngineConfig;
use crate::cycle::{Attribution, CycleRepository};
use crate::dedup::{DedupIndex, DedupOutcome};
use crate::dispatch::{dispatch_with_retry, ChainDispatcher, ClaimBook, DispatchReport};
use crate::error::RewardsError;
use crate::identity::{IdentityDirectory, IdentitySnapshot};
use crate::journal::{JournalEntry, JournalEntryKind, JournalQuery};
use crate::normalizer::{EventNormalizer, SubmitRawEvent};
use crate::reconciler::{reconcile, ManifestStore, ManifestWrite, ReconcileInput};
use crate::storage::PersistentJournal;
use crate::types::{
    AdmissionReceipt, AllocationManifest, ClaimRecord, ContributionId, ContributorId, Cycle,
    CycleId, CycleState, CycleWindow, EventId, Handle, ProviderKind, RawEvent, Suggestion,
};

/// Lifecycle notifications published to collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum CycleSignal {
    Locked {
        cycle_id: CycleId,
        contributions: usize,
    },
    Allocated {
        cycle_id: CycleId,
        manifest_hash: String,
    },
    Blocked {
        cycle_id: CycleId,
        reason: String,
    },
    DispatchExhausted {
        cycle_id: CycleId,
        attempts: u32,
        addresses: Vec<String>,
    },
    ManualResolution {
        cycle_id: CycleId,
        cleared: Option<String>,
    },
    ClaimWindowOpened {
        cycle_id: CycleId,
        closes_at: DateTime<Utc>,
    },
    Closed {
        cycle_id: CycleId,
        reason: String,
    },
}

/// A stored event and where admission placed it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: RawEvent,
    pub admission_seq: u64,
    /// `None` while deferred to the next cycle.
    pub cycle_id: Option<CycleId>,
    pub supersedes: Option<EventId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub locked: Vec<CycleId>,
    pub closed: Vec<CycleId>,
    pub failures: Vec<String>,
}

#[derive(Debug)]
struct DeferredEvent {
    event: RawEvent,
    seq: u64,
    suggester: ContributorId,
}

enum Placement {
    Assigned {
        cycle_id: CycleId,
        guard: InFlightGuard,
    },
    Deferred,
}

fn gate_poisoned<T>(_: PoisonError<T>) -> RewardsError {
    RewardsError::InvariantViolation("cycle admission gate poisoned".to_string())
}

/// Rewards engine: admission, aggregation, cycle lifecycle, reconciliation and dispatch.
///
/// Admission takes the cycle gate for reading and transitions that change cycle
/// membership take it for writing, so the `ACTIVE -> LOCKING` edge is ordered against
/// every admission. Long-running transitions (barrier wait, reconciliation, dispatch)
/// are serialized per cycle by an async mutex instead.
pub struct RewardsEngine {
    config: EngineConfig,
    normalizer: EventNormalizer,
    dedup: DedupIndex,
    aggregator: ContributionAggregator,
    cycles: RwLock<CycleRepository>,
    deferred: Mutex<Vec<DeferredEvent>>,
    cycle_gates: DashMap<CycleId, Arc<AsyncMutex<()>>>,
    events: DashMap<EventId, StoredEvent>,
    admission_seq: AtomicU64,
    manifests: ManifestStore,
    claims: ClaimBook,
    resolutions: DashMap<CycleId, BTreeMap<ContributorId, String>>,
    identity: Arc<dyn IdentityDirectory>,
    dispatcher: Arc<dyn ChainDispatcher>,
    journal: AsyncMutex<PersistentJournal>,
    signals: broadcast::Sender<CycleSignal>,
}

impl RewardsEngine {
    pub async fn bootstrap(
        config: EngineConfig,
        identity: Arc<dyn IdentityDirectory>,
        dispatcher: Arc<dyn ChainDispatcher>,
    ) -> Result<Self, RewardsError> {
        let journal = PersistentJournal::bootstrap(&config.journal_storage).await?;
        info!(
            journal_backend = journal.backend_label(),
            journal_entries = journal.entries().len(),
            dispatcher = dispatcher.name(),
            "rewards engine bootstrapped"
        );
        let (signals, _) = broadcast::channel(config.signal_capacity.max(1));

        Ok(Self {
            normalizer: EventNormalizer::new(&config),
            aggregator: ContributionAggregator::new(config.aggregation, config.currency_unit.clone()),
            dedup: DedupIndex::new(),
            cycles: RwLock::new(CycleRepository::new()),
            deferred: Mutex::new(Vec::new()),
            cycle_gates: DashMap::new(),
            events: DashMap::new(),
            admission_seq: AtomicU64::new(0),
            manifests: ManifestStore::new(),
            claims: ClaimBook::new(),
            resolutions: DashMap::new(),
            identity,
            dispatcher,
            journal: AsyncMutex::new(journal),
            signals,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CycleSignal> {
        self.signals.subscribe()
    }

    // ---------------------------------------------------------------------
    // Admission
    // ---------------------------------------------------------------------

    /// Normalize a provider payload and admit it.
    pub async fn submit_provider_payload(
        &self,
        provider: ProviderKind,
        raw: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<AdmissionReceipt, RewardsError> {
        let event = self
            .normalizer
            .normalize(provider, raw, received_at)
            .map_err(|err| {
                warn!(provider = %provider, error = %err, "rejected malformed payload");
                err
            })?;
        self.admit(event).await
    }

    pub async fn submit_raw_event(
        &self,
        submission: &SubmitRawEvent,
    ) -> Result<AdmissionReceipt, RewardsError> {
        let event = self
            .normalizer
            .normalize_submission(submission)
            .map_err(|err| {
                warn!(
                    provider = %submission.provider,
                    external_id = %submission.external_id,
                    error = %err,
                    "rejected malformed submission"
                );
                err
            })?;
        self.admit(event).await
    }

    /// Admit a normalized event. Duplicates return a non-accepted receipt, not an error.
    #[instrument(skip(self, event), fields(provider = %event.provider, external_id = %event.external_id))]
    pub async fn admit(&self, event: RawEvent) -> Result<AdmissionReceipt, RewardsError> {
        self.aggregator.validate(&event).map_err(|err| {
            warn!(error = %err, "rejected event before admission");
            err
        })?;
        let suggester = self.suggester_for(&event.author_identity).await?;

        let (outcome, seq, placement) = {
            let cycles = self.cycles.read().map_err(gate_poisoned)?;
            let outcome = self.dedup.admit(&event);
            if let DedupOutcome::Duplicate(existing) = &outcome {
                debug!(existing = %existing, "duplicate delivery ignored");
                return Ok(AdmissionReceipt::duplicate(existing));
            }
            let seq = self.admission_seq.fetch_add(1, Ordering::SeqCst);
            let placement = match cycles.attribute(event.received_at) {
                Attribution::Cycle(cycle_id) => {
                    let guard = self.aggregator.track(&cycle_id);
                    Placement::Assigned { cycle_id, guard }
                }
                Attribution::Deferred => {
                    // Stored before it becomes drainable, so `open_cycle` always finds it.
                    let mut deferred = self.deferred.lock().map_err(gate_poisoned)?;
                    self.store_event(event.clone(), seq, None, outcome.superseded().cloned());
                    deferred.push(DeferredEvent {
                        event: event.clone(),
                        seq,
                        suggester: suggester.clone(),
                    });
                    Placement::Deferred
                }
            };
            (outcome, seq, placement)
        };

        let event_id = event.event_id.clone();
        let supersedes = outcome.superseded().cloned();
        let audit = json!({
            "event_id": event_id,
            "provider": event.provider,
            "external_id": event.external_id,
            "kind": event.kind,
            "correlation_key": event.payload.correlation_key,
            "content_hash": event.content_hash,
            "supersedes": supersedes,
            "admission_seq": seq,
        });

        match placement {
            Placement::Assigned { cycle_id, guard } => {
                let aggregated =
                    match self.aggregator.ingest_as(&cycle_id, &event, seq, suggester) {
                        Ok(aggregated) => aggregated,
                        Err(err) => {
                            self.dedup.retract(&event);
                            drop(guard);
                            warn!(cycle_id = %cycle_id, error = %err, "event not aggregated");
                            return Err(err);
                        }
                    };
                self.store_event(event, seq, Some(cycle_id.clone()), supersedes);
                // The guard spans the journal append so a lock cannot be chained ahead of it.
                let journaled = self
                    .record(JournalEntryKind::EventAdmitted, Some(&cycle_id), audit)
                    .await;
                drop(guard);
                journaled?;
                debug!(
                    cycle_id = %cycle_id,
                    contribution_id = %aggregated.contribution_id,
                    resolved_amount = ?aggregated.resolved_amount,
                    "event aggregated"
                );
                Ok(AdmissionReceipt::accepted(event_id, Some(cycle_id)))
            }
            Placement::Deferred => {
                self.record(JournalEntryKind::EventDeferred, None, audit).await?;
                info!(event_id = %event_id, "no admitting cycle; event deferred");
                Ok(AdmissionReceipt::accepted(event_id, None))
            }
        }
    }

    /// Linked contributor of a suggesting handle, or its unlinked identity.
    async fn suggester_for(&self, author: &Handle) -> Result<ContributorId, RewardsError> {
        Ok(self
            .identity
            .contributor_for(author)
            .await?
            .unwrap_or_else(|| author.unlinked_contributor()))
    }

    fn store_event(
        &self,
        event: RawEvent,
        admission_seq: u64,
        cycle_id: Option<CycleId>,
        supersedes: Option<EventId>,
    ) {
        self.events.insert(
            event.event_id.clone(),
            StoredEvent {
                event,
                admission_seq,
                cycle_id,
                supersedes,
            },
        );
    }

    // ---------------------------------------------------------------------
    // Cycle control
    // ---------------------------------------------------------------------

    /// Open a new `ACTIVE` cycle and move deferred events into it.
    #[instrument(skip(self), fields(start = %window.start, end = %window.end))]
    pub async fn open_cycle(&self, window: CycleWindow) -> Result<Cycle, RewardsError> {
        let now = Utc::now();
        let (cycle, mut drained) = {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            let cycle = cycles.open(window, now)?;
            let mut deferred = self.deferred.lock().map_err(gate_poisoned)?;
            let (ready, waiting): (Vec<_>, Vec<_>) = deferred
                .drain(..)
                .partition(|held| held.event.received_at < window.end);
            *deferred = waiting;
            let drained: Vec<(DeferredEvent, InFlightGuard)> = ready
                .into_iter()
                .map(|held| {
                    let guard = self.aggregator.track(&cycle.cycle_id);
                    (held, guard)
                })
                .collect();
            (cycle, drained)
        };

        drained.sort_by_key(|(held, _)| held.seq);
        let drained_count = drained.len();
        let mut guards = Vec::with_capacity(drained_count);
        for (held, guard) in drained {
            guards.push(guard);
            let DeferredEvent {
                event,
                seq,
                suggester,
            } = held;
            if let Err(err) = self
                .aggregator
                .ingest_as(&cycle.cycle_id, &event, seq, suggester)
            {
                warn!(event_id = %event.event_id, error = %err, "deferred event not aggregated");
                continue;
            }
            if let Some(mut stored) = self.events.get_mut(&event.event_id) {
                stored.cycle_id = Some(cycle.cycle_id.clone());
            }
        }

        let journaled = self.record(
            JournalEntryKind::Transition,
            Some(&cycle.cycle_id),
            json!({
                "from": Value::Null,
                "to": CycleState::Active,
                "window": cycle.window,
                "drained_events": drained_count,
            }),
        )
        .await;
        drop(guards);
        journaled?;
        info!(cycle_id = %cycle.cycle_id, drained = drained_count, "cycle opened");
        Ok(cycle)
    }

    /// Operator or window-expiry lock: `ACTIVE -> LOCKING -> LOCKED`.
    ///
    /// Re-invoking on a `LOCKING` cycle retries the barrier wait.
    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub async fn lock_cycle(&self, cycle_id: &CycleId) -> Result<Cycle, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        let began = {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            let cycle = cycles.get(cycle_id)?.clone();
            if let Some(reason) = cycle.blocked {
                return Err(RewardsError::blocked(cycle_id, reason));
            }
            match cycle.state {
                CycleState::Active => {
                    cycles.advance(cycle_id, CycleState::Active, CycleState::Locking, Utc::now())?;
                    true
                }
                CycleState::Locking => false,
                other => {
                    return Err(RewardsError::transition_violation(
                        cycle_id,
                        CycleState::Active.name(),
                        other.name(),
                    ))
                }
            }
        };
        if began {
            self.record_transition(cycle_id, CycleState::Active, CycleState::Locking, json!({}))
                .await?;
            info!("admission closed; waiting for aggregation barrier");
        }

        let barrier = tokio::time::timeout(
            self.config.lock_barrier_timeout,
            self.aggregator.barrier().wait_quiescent(cycle_id),
        )
        .await;
        if barrier.is_err() {
            let in_flight = self.aggregator.barrier().in_flight(cycle_id);
            let reason = format!("aggregation barrier stalled with {in_flight} event(s) in flight");
            return Err(self.block_cycle(cycle_id, reason).await);
        }

        let advanced = {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            cycles.advance(cycle_id, CycleState::Locking, CycleState::Locked, Utc::now())
        };
        let cycle = match advanced {
            Ok(cycle) => cycle,
            Err(err) => {
                if let RewardsError::CycleBlocked { reason, .. } = &err {
                    warn!(reason = %reason, "cycle held in locking");
                    self.emit(CycleSignal::Blocked {
                        cycle_id: cycle_id.clone(),
                        reason: reason.clone(),
                    });
                }
                return Err(err);
            }
        };

        let frozen = self.aggregator.lock_cycle(cycle_id);
        self.record_transition(
            cycle_id,
            CycleState::Locking,
            CycleState::Locked,
            json!({ "contributions": frozen }),
        )
        .await?;
        info!(contributions = frozen, "cycle locked");
        self.emit(CycleSignal::Locked {
            cycle_id: cycle_id.clone(),
            contributions: frozen,
        });
        Ok(cycle)
    }

    /// Reconcile a locked cycle into its manifest. Runs once; later calls return the
    /// stored manifest as `AlreadyAllocated` without writing anything.
    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub async fn allocate(&self, cycle_id: &CycleId) -> Result<ManifestWrite, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        if let Some(existing) = self.manifests.get(cycle_id) {
            debug!("cycle already allocated");
            return Ok(ManifestWrite::AlreadyAllocated(existing));
        }

        let cycle = self.cycle(cycle_id)?;
        if let Some(reason) = cycle.blocked {
            return Err(RewardsError::blocked(cycle_id, reason));
        }
        if !cycle.state.is_allocating() {
            return Err(RewardsError::transition_violation(
                cycle_id,
                CycleState::Locked.name(),
                cycle.state.name(),
            ));
        }

        let contributions = self.aggregator.contributions(cycle_id);
        let handles: Vec<&Handle> = contributions
            .iter()
            .filter_map(|resolved| resolved.contribution.contributor.as_ref())
            .collect();
        let resolutions = self
            .resolutions
            .get(cycle_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let snapshot = IdentitySnapshot::capture(self.identity.as_ref(), handles)
            .await?
            .with_resolutions(&resolutions);
        let resolved: BTreeSet<ContributorId> = resolutions.keys().cloned().collect();

        let outcome = reconcile(ReconcileInput {
            cycle_id,
            currency_unit: &self.config.currency_unit,
            contributions: &contributions,
            identities: &snapshot,
            similarity_threshold: self.config.handle_similarity_threshold,
            resolved: &resolved,
            created_at: Utc::now(),
        });

        match outcome {
            Ok(manifest) => {
                let write = self.manifests.insert_once(manifest);
                if matches!(write, ManifestWrite::AlreadyAllocated(_)) {
                    return Ok(write);
                }
                let manifest = write.manifest();
                self.claims.seed(manifest);
                if cycle.state == CycleState::Locked {
                    {
                        let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
                        cycles.advance(
                            cycle_id,
                            CycleState::Locked,
                            CycleState::Allocating,
                            Utc::now(),
                        )?;
                    }
                    self.record_transition(
                        cycle_id,
                        CycleState::Locked,
                        CycleState::Allocating,
                        json!({ "manifest_hash": manifest.manifest_hash }),
                    )
                    .await?;
                }
                let payload = serde_json::to_value(manifest)
                    .map_err(|e| RewardsError::Serialization(e.to_string()))?;
                self.record(JournalEntryKind::Manifest, Some(cycle_id), payload)
                    .await?;

                if !manifest.conflicts.is_empty() {
                    warn!(
                        conflicts = manifest.conflicts.len(),
                        "identity conflicts reported; affected contributions withheld"
                    );
                }
                info!(
                    allocations = manifest.allocations.len(),
                    total_amount = manifest.total_amount,
                    manifest_hash = %manifest.manifest_hash,
                    "allocation manifest computed"
                );
                Ok(write)
            }
            Err(RewardsError::IdentityConflict(conflicts)) => {
                let reason = format!(
                    "identity conflicts block every allocatable contributor ({} group(s))",
                    conflicts.len()
                );
                self.block_cycle(cycle_id, reason).await;
                Err(RewardsError::IdentityConflict(conflicts))
            }
            Err(RewardsError::EmptyCycle(empty)) => {
                self.close_empty_cycle(cycle_id).await?;
                Err(RewardsError::EmptyCycle(empty))
            }
            Err(err) => Err(err),
        }
    }

    /// Send the manifest to the chain. `ALLOCATED` is reached only once every address
    /// is acknowledged; exhausted retries leave the cycle in `ALLOCATING`.
    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub async fn dispatch(&self, cycle_id: &CycleId) -> Result<DispatchReport, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        let cycle = self.cycle(cycle_id)?;
        if cycle.state != CycleState::Allocating {
            return Err(RewardsError::transition_violation(
                cycle_id,
                CycleState::Allocating.name(),
                cycle.state.name(),
            ));
        }
        let manifest = self.manifests.get(cycle_id).ok_or_else(|| {
            RewardsError::InvariantViolation(format!("cycle {cycle_id} has no manifest"))
        })?;

        let dispatched = dispatch_with_retry(
            self.dispatcher.as_ref(),
            &self.config.dispatch_retry,
            self.config.dispatch_timeout,
            &manifest,
            &self.claims,
        )
        .await;

        match dispatched {
            Ok(report) => {
                self.record(
                    JournalEntryKind::Dispatch,
                    Some(cycle_id),
                    json!({
                        "outcome": "acknowledged",
                        "attempts": report.attempts,
                        "tx_refs": report.tx_refs,
                    }),
                )
                .await?;
                {
                    let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
                    cycles.advance(
                        cycle_id,
                        CycleState::Allocating,
                        CycleState::Allocated,
                        Utc::now(),
                    )?;
                }
                self.record_transition(
                    cycle_id,
                    CycleState::Allocating,
                    CycleState::Allocated,
                    json!({}),
                )
                .await?;
                info!(attempts = report.attempts, "manifest fully acknowledged");
                self.emit(CycleSignal::Allocated {
                    cycle_id: cycle_id.clone(),
                    manifest_hash: manifest.manifest_hash.clone(),
                });
                Ok(report)
            }
            Err(err) => {
                let addresses: Vec<String> =
                    self.claims.unacknowledged(cycle_id).into_iter().collect();
                let attempts = match &err {
                    RewardsError::DispatchFailure { attempts, .. } => *attempts,
                    _ => 0,
                };
                if let Err(journal_err) = self
                    .record(
                        JournalEntryKind::Dispatch,
                        Some(cycle_id),
                        json!({
                            "outcome": "exhausted",
                            "attempts": attempts,
                            "error": err.to_string(),
                            "failed_addresses": addresses,
                        }),
                    )
                    .await
                {
                    warn!(error = %journal_err, "dispatch failure not journaled");
                }
                warn!(
                    attempts,
                    failed = addresses.len(),
                    error = %err,
                    "chain dispatch exhausted; records marked failed"
                );
                self.emit(CycleSignal::DispatchExhausted {
                    cycle_id: cycle_id.clone(),
                    attempts,
                    addresses,
                });
                Err(err)
            }
        }
    }

    /// Manual retry of addresses whose dispatch failed.
    pub async fn retry_failed_dispatch(
        &self,
        cycle_id: &CycleId,
    ) -> Result<DispatchReport, RewardsError> {
        if !self.claims.has_failures(cycle_id) {
            return Err(RewardsError::InvariantViolation(format!(
                "cycle {cycle_id} has no failed dispatch records"
            )));
        }
        info!(cycle_id = %cycle_id, "manual dispatch retry");
        self.dispatch(cycle_id).await
    }

    /// Clear a blocked cycle, optionally settling contributor addresses for the next
    /// reconciliation. Logged as a manual resolution.
    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub async fn force_unblock(
        &self,
        cycle_id: &CycleId,
        resolutions: BTreeMap<ContributorId, String>,
    ) -> Result<Cycle, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        if let Some((contributor, _)) = resolutions
            .iter()
            .find(|(_, address)| address.trim().is_empty())
        {
            return Err(RewardsError::Identity(format!(
                "empty address resolution for {contributor}"
            )));
        }

        let (cleared, cycle) = {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            let cleared = cycles.unblock(cycle_id, Utc::now())?;
            (cleared, cycles.get(cycle_id)?.clone())
        };
        if !resolutions.is_empty() {
            let mut settled = self.resolutions.entry(cycle_id.clone()).or_default();
            for (contributor, address) in &resolutions {
                settled.insert(contributor.clone(), address.trim().to_string());
            }
        }

        self.record(
            JournalEntryKind::ManualResolution,
            Some(cycle_id),
            json!({
                "cleared": cleared,
                "state": cycle.state,
                "resolutions": resolutions,
            }),
        )
        .await?;
        warn!(
            cleared = ?cleared,
            resolutions = resolutions.len(),
            "manual resolution applied"
        );
        self.emit(CycleSignal::ManualResolution {
            cycle_id: cycle_id.clone(),
            cleared,
        });
        Ok(cycle)
    }

    #[instrument(skip(self), fields(cycle_id = %cycle_id))]
    pub async fn open_claim_window(
        &self,
        cycle_id: &CycleId,
        closes_at: DateTime<Utc>,
    ) -> Result<Cycle, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        let now = Utc::now();
        if closes_at <= now {
            return Err(RewardsError::InvariantViolation(format!(
                "claim window must close in the future (got {closes_at})"
            )));
        }
        let cycle = {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            cycles.advance(cycle_id, CycleState::Allocated, CycleState::ClaimOpen, now)?;
            cycles.set_claim_closes_at(cycle_id, closes_at)?;
            cycles.get(cycle_id)?.clone()
        };
        self.record_transition(
            cycle_id,
            CycleState::Allocated,
            CycleState::ClaimOpen,
            json!({ "closes_at": closes_at }),
        )
        .await?;
        info!(closes_at = %closes_at, "claim window opened");
        self.emit(CycleSignal::ClaimWindowOpened {
            cycle_id: cycle_id.clone(),
            closes_at,
        });
        Ok(cycle)
    }

    pub async fn record_claim(
        &self,
        cycle_id: &CycleId,
        address: &str,
        tx_ref: &str,
    ) -> Result<ClaimRecord, RewardsError> {
        self.settle_claim(cycle_id, address, tx_ref, false).await
    }

    pub async fn record_reclaim(
        &self,
        cycle_id: &CycleId,
        address: &str,
        tx_ref: &str,
    ) -> Result<ClaimRecord, RewardsError> {
        self.settle_claim(cycle_id, address, tx_ref, true).await
    }

    async fn settle_claim(
        &self,
        cycle_id: &CycleId,
        address: &str,
        tx_ref: &str,
        reclaim: bool,
    ) -> Result<ClaimRecord, RewardsError> {
        let gate = self.cycle_gate(cycle_id);
        let _held = gate.lock().await;

        let cycle = self.cycle(cycle_id)?;
        if cycle.state != CycleState::ClaimOpen {
            return Err(RewardsError::transition_violation(
                cycle_id,
                CycleState::ClaimOpen.name(),
                cycle.state.name(),
            ));
        }
        let record = if reclaim {
            self.claims.record_reclaim(cycle_id, address, tx_ref)?
        } else {
            self.claims.record_claim(cycle_id, address, tx_ref)?
        };
        let payload = serde_json::to_value(&record)
            .map_err(|e| RewardsError::Serialization(e.to_string()))?;
        self.record(JournalEntryKind::Claim, Some(cycle_id), payload)
            .await?;

        if self.claims.all_settled(cycle_id) {
            self.close_claim_window(cycle_id, "all allocations settled")
                .await?;
        }
        Ok(record)
    }

    /// Drive time-based transitions: expired windows lock, expired claim windows close.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, RewardsError> {
        let (to_lock, to_close) = {
            let cycles = self.cycles.read().map_err(gate_poisoned)?;
            let allocating_free = cycles.allocating().is_none();
            let to_lock: Vec<CycleId> = cycles
                .admitting()
                .filter(|cycle| cycle.blocked.is_none())
                .filter(|cycle| match cycle.state {
                    CycleState::Active => cycle.window.end <= now,
                    _ => allocating_free,
                })
                .map(|cycle| cycle.cycle_id.clone())
                .into_iter()
                .collect();
            let to_close: Vec<CycleId> = cycles
                .in_state(CycleState::ClaimOpen)
                .into_iter()
                .filter(|cycle| cycle.claim_closes_at.is_some_and(|at| at <= now))
                .map(|cycle| cycle.cycle_id)
                .collect();
            (to_lock, to_close)
        };

        let mut report = TickReport::default();
        for cycle_id in to_lock {
            match self.lock_cycle(&cycle_id).await {
                Ok(_) => report.locked.push(cycle_id),
                Err(err) => report.failures.push(format!("lock {cycle_id}: {err}")),
            }
        }
        for cycle_id in to_close {
            let gate = self.cycle_gate(&cycle_id);
            let _held = gate.lock().await;
            match self.close_claim_window(&cycle_id, "claim window expired").await {
                Ok(()) => report.closed.push(cycle_id),
                Err(err) => report.failures.push(format!("close {cycle_id}: {err}")),
            }
        }
        if !report.failures.is_empty() {
            debug!(failures = ?report.failures, "tick left cycles in place");
        }
        Ok(report)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn cycle(&self, cycle_id: &CycleId) -> Result<Cycle, RewardsError> {
        let cycles = self.cycles.read().map_err(gate_poisoned)?;
        cycles.get(cycle_id).cloned()
    }

    pub fn cycles(&self) -> Result<Vec<Cycle>, RewardsError> {
        let cycles = self.cycles.read().map_err(gate_poisoned)?;
        Ok(cycles.list())
    }

    pub fn contributions(&self, cycle_id: &CycleId) -> Vec<ResolvedContribution> {
        self.aggregator.contributions(cycle_id)
    }

    pub fn contribution(&self, contribution_id: &ContributionId) -> Option<ResolvedContribution> {
        self.aggregator.contribution(contribution_id)
    }

    pub fn suggestion_log(&self, contribution_id: &ContributionId) -> Vec<Suggestion> {
        self.aggregator.suggestion_log(contribution_id)
    }

    pub fn manifest(&self, cycle_id: &CycleId) -> Option<AllocationManifest> {
        self.manifests.get(cycle_id)
    }

    pub fn claims(&self, cycle_id: &CycleId) -> Vec<ClaimRecord> {
        self.claims.records(cycle_id)
    }

    pub fn event(&self, event_id: &EventId) -> Option<StoredEvent> {
        self.events.get(event_id).map(|entry| entry.value().clone())
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn deferred_count(&self) -> Result<usize, RewardsError> {
        Ok(self.deferred.lock().map_err(gate_poisoned)?.len())
    }

    pub async fn journal_entries(&self, query: &JournalQuery) -> Vec<JournalEntry> {
        self.journal.lock().await.query(query)
    }

    pub async fn verify_journal(&self) -> bool {
        self.journal.lock().await.verify_chain()
    }

    pub async fn journal_backend(&self) -> &'static str {
        self.journal.lock().await.backend_label()
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    fn cycle_gate(&self, cycle_id: &CycleId) -> Arc<AsyncMutex<()>> {
        self.cycle_gates
            .entry(cycle_id.clone())
            .or_default()
            .value()
            .clone()
    }

    fn emit(&self, signal: CycleSignal) {
        // No subscribers is fine.
        let _ = self.signals.send(signal);
    }

    async fn record(
        &self,
        kind: JournalEntryKind,
        cycle_id: Option<&CycleId>,
        payload: Value,
    ) -> Result<(), RewardsError> {
        let mut journal = self.journal.lock().await;
        journal
            .append(kind, cycle_id, payload)
            .await
            .map(|_| ())
            .map_err(|err| {
                warn!(kind = kind.as_str(), error = %err, "journal append failed");
                err
            })
    }

    async fn record_transition(
        &self,
        cycle_id: &CycleId,
        from: CycleState,
        to: CycleState,
        detail: Value,
    ) -> Result<(), RewardsError> {
        self.record(
            JournalEntryKind::Transition,
            Some(cycle_id),
            json!({ "from": from, "to": to, "detail": detail }),
        )
        .await
    }

    /// Halt a cycle where it stands. Returns the error to surface.
    async fn block_cycle(&self, cycle_id: &CycleId, reason: String) -> RewardsError {
        let blocked = match self.cycles.write() {
            Ok(mut cycles) => cycles.block(cycle_id, reason.clone(), Utc::now()).map(|_| ()),
            Err(poisoned) => Err(gate_poisoned(poisoned)),
        };
        if let Err(err) = blocked {
            return err;
        }
        if let Err(err) = self
            .record(
                JournalEntryKind::Transition,
                Some(cycle_id),
                json!({ "blocked": reason }),
            )
            .await
        {
            warn!(error = %err, "blocked cycle not journaled");
        }
        warn!(cycle_id = %cycle_id, reason = %reason, "cycle blocked; manual resolution required");
        self.emit(CycleSignal::Blocked {
            cycle_id: cycle_id.clone(),
            reason: reason.clone(),
        });
        RewardsError::blocked(cycle_id, reason)
    }

    /// An empty cycle skips allocation and closes immediately.
    async fn close_empty_cycle(&self, cycle_id: &CycleId) -> Result<(), RewardsError> {
        let edges = [
            (CycleState::Locked, CycleState::Allocating),
            (CycleState::Allocating, CycleState::Allocated),
            (CycleState::Allocated, CycleState::ClaimOpen),
            (CycleState::ClaimOpen, CycleState::Closed),
        ];
        let mut walked = Vec::new();
        {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            let mut state = cycles.get(cycle_id)?.state;
            for (from, to) in edges {
                if state == from {
                    cycles.advance(cycle_id, from, to, Utc::now())?;
                    walked.push((from, to));
                    state = to;
                }
            }
        }
        for (from, to) in walked {
            self.record_transition(cycle_id, from, to, json!({ "reason": "empty_cycle" }))
                .await?;
        }
        info!(cycle_id = %cycle_id, "empty cycle closed without allocation");
        self.emit(CycleSignal::Closed {
            cycle_id: cycle_id.clone(),
            reason: "empty_cycle".to_string(),
        });
        Ok(())
    }

    /// `CLAIM_OPEN -> CLOSED`. Callers hold the cycle gate.
    async fn close_claim_window(&self, cycle_id: &CycleId, reason: &str) -> Result<(), RewardsError> {
        {
            let mut cycles = self.cycles.write().map_err(gate_poisoned)?;
            cycles.advance(cycle_id, CycleState::ClaimOpen, CycleState::Closed, Utc::now())?;
        }
        self.record_transition(
            cycle_id,
            CycleState::ClaimOpen,
            CycleState::Closed,
            json!({ "reason": reason }),
        )
        .await?;
        info!(cycle_id = %cycle_id, reason, "cycle closed");
        self.emit(CycleSignal::Closed {
            cycle_id: cycle_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchAck;
    use crate::identity::IdentityRegistry;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AckAll;

    #[async_trait]
    impl ChainDispatcher for AckAll {
        fn name(&self) -> &str {
            "ack-all"
        }

        async fn dispatch_allocations(
            &self,
            _cycle_id: &CycleId,
            manifest: &AllocationManifest,
        ) -> Result<DispatchAck, RewardsError> {
            Ok(DispatchAck {
                tx_refs: manifest
                    .addresses()
                    .into_iter()
                    .map(|address| (address.clone(), format!("tx-{address}")))
                    .collect(),
            })
        }
    }

    async fn engine(barrier: Duration) -> RewardsEngine {
        let config = EngineConfig {
            lock_barrier_timeout: barrier,
            ..EngineConfig::default()
        };
        RewardsEngine::bootstrap(config, Arc::new(IdentityRegistry::new()), Arc::new(AckAll))
            .await
            .unwrap()
    }

    async fn open_now(engine: &RewardsEngine) -> Cycle {
        let now = Utc::now();
        engine
            .open_cycle(CycleWindow::new(
                now - chrono::Duration::hours(1),
                now + chrono::Duration::hours(1),
            ))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn stalled_barrier_blocks_until_unblocked() {
        let engine = engine(Duration::from_millis(30)).await;
        let cycle = open_now(&engine).await;
        let mut signals = engine.subscribe();
        let in_flight = engine.aggregator.track(&cycle.cycle_id);

        let err = engine.lock_cycle(&cycle.cycle_id).await.unwrap_err();
        assert!(matches!(err, RewardsError::CycleBlocked { .. }));
        let stalled = engine.cycle(&cycle.cycle_id).unwrap();
        assert_eq!(stalled.state, CycleState::Locking);
        assert!(stalled
            .blocked
            .as_deref()
            .unwrap_or_default()
            .contains("1 event(s) in flight"));
        assert!(matches!(
            signals.try_recv(),
            Ok(CycleSignal::Blocked { .. })
        ));

        drop(in_flight);
        assert!(matches!(
            engine.lock_cycle(&cycle.cycle_id).await,
            Err(RewardsError::CycleBlocked { .. })
        ));

        engine
            .force_unblock(&cycle.cycle_id, BTreeMap::new())
            .await
            .unwrap();
        let locked = engine.lock_cycle(&cycle.cycle_id).await.unwrap();
        assert_eq!(locked.state, CycleState::Locked);
        assert!(locked.blocked.is_none());
    }

    #[tokio::test]
    async fn lock_waits_for_in_flight_admission() {
        let engine = engine(Duration::from_secs(2)).await;
        let cycle = open_now(&engine).await;
        let in_flight = engine.aggregator.track(&cycle.cycle_id);

        let (locked, _) = tokio::join!(engine.lock_cycle(&cycle.cycle_id), async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            drop(in_flight);
        });
        let locked = locked.unwrap();
        assert_eq!(locked.state, CycleState::Locked);

        let transitions = engine
            .journal_entries(&JournalQuery {
                kind: Some(JournalEntryKind::Transition),
                cycle_id: Some(cycle.cycle_id.clone()),
                limit: None,
            })
            .await;
        assert_eq!(transitions.len(), 3);
    }

    #[tokio::test]
    async fn deferred_event_is_stored_before_it_can_drain() {
        let engine = engine(Duration::from_millis(200)).await;
        let now = Utc::now();
        let event = engine
            .normalizer()
            .normalize_submission(&SubmitRawEvent {
                provider: ProviderKind::DiscordBot,
                external_id: "s-1".to_string(),
                author_identity: "sam".to_string(),
                kind: crate::types::EventKind::Suggestion,
                payload: json!({"target": "issue #3", "amount": 4, "contributor": "dana"}),
                received_at: now,
            })
            .unwrap();
        let receipt = engine.admit(event).await.unwrap();
        let event_id = receipt.event_id.unwrap();
        assert_eq!(engine.deferred_count().unwrap(), 1);
        assert_eq!(engine.event(&event_id).unwrap().cycle_id, None);

        let cycle = open_now(&engine).await;
        assert_eq!(
            engine.event(&event_id).unwrap().cycle_id,
            Some(cycle.cycle_id)
        );
    }
}
