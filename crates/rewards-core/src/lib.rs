//! Contribution rewards core.
//!
//! Provider events are normalized, deduplicated by lineage and content hash, and folded
//! into per-cycle contributions. Cycles move through a strict lifecycle; a locked cycle is
//! reconciled against identity records into an immutable allocation manifest which is
//! dispatched to the chain with bounded retry. Every state change lands in a hash-chained
//! audit journal.

#![deny(unsafe_code)]

pub mod aggregator;
pub mod config;
pub mod cycle;
pub mod dedup;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod identity;
pub mod journal;
pub mod normalizer;
pub mod reconciler;
pub mod storage;
pub mod types;

pub use aggregator::{
    resolve_amount, select_latest, AggregationResult, ContributionAggregator, InFlightGuard,
    QuiescenceBarrier, ResolvedContribution,
};
pub use config::{AggregationPolicy, EngineConfig, RewardCatalog, RewardTypeEntry};
pub use cycle::{Attribution, CycleRepository};
pub use dedup::{DedupIndex, DedupOutcome};
pub use dispatch::{
    dispatch_with_retry, ChainDispatcher, ClaimBook, DispatchAck, DispatchReport, RetryPolicy,
};
pub use engine::{CycleSignal, RewardsEngine, StoredEvent, TickReport};
pub use error::RewardsError;
pub use identity::{
    trigram_similarity, IdentityDirectory, IdentityRegistry, IdentitySnapshot, IdentityView,
};
pub use journal::{AuditJournal, JournalEntry, JournalEntryKind, JournalQuery};
pub use normalizer::{EventNormalizer, SubmitRawEvent};
pub use reconciler::{reconcile, ManifestStore, ManifestWrite, ReconcileInput};
pub use storage::{JournalStorageConfig, PersistentJournal};
pub use types::{
    AdmissionReceipt, Allocation, AllocationManifest, ClaimRecord, ClaimStatus, Contribution,
    ContributionId, ContributionStatus, ContributorId, CorrelationKey, Cycle, CycleId,
    CycleState, CycleWindow, EventId, EventKind, EventPayload, Handle, IdentityConflict,
    Lineage, Platform, ProviderFamily, ProviderKind, RawEvent, SuggestedAmount, Suggestion,
    UnallocatedContribution, UnallocatedReason,
};
