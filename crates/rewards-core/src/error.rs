use thiserror::Error;

use crate::types::{CycleId, EventId, IdentityConflict};

/// Rewards engine errors.
#[derive(Debug, Error)]
pub enum RewardsError {
    #[error("Malformed payload from '{provider}': {reason}")]
    MalformedPayload { provider: String, reason: String },

    #[error("Duplicate event: already admitted as {0}")]
    DuplicateEvent(EventId),

    #[error("Identity conflict blocks {} contributor group(s)", .0.len())]
    IdentityConflict(Vec<IdentityConflict>),

    #[error("Cycle {cycle_id} blocked: {reason}")]
    CycleBlocked { cycle_id: CycleId, reason: String },

    #[error("Cycle {0} has no allocatable contributions")]
    EmptyCycle(CycleId),

    #[error("Dispatch failed after {attempts} attempt(s): {message}")]
    DispatchFailure { attempts: u32, message: String },

    #[error("Cycle {0} not found")]
    CycleNotFound(CycleId),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Identity directory error: {0}")]
    Identity(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RewardsError {
    pub fn malformed(provider: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            provider: provider.into(),
            reason: reason.into(),
        }
    }

    pub fn transition_violation(cycle_id: &CycleId, expected: &str, actual: &str) -> Self {
        Self::InvariantViolation(format!(
            "cycle {} transition order violation: expected '{}', got '{}'",
            cycle_id, expected, actual
        ))
    }

    pub fn blocked(cycle_id: &CycleId, reason: impl Into<String>) -> Self {
        Self::CycleBlocked {
            cycle_id: cycle_id.clone(),
            reason: reason.into(),
        }
    }

    /// Errors that the engine recovers from locally and never surfaces as failures.
    pub fn is_locally_recovered(&self) -> bool {
        matches!(self, Self::DuplicateEvent(_))
    }
}
