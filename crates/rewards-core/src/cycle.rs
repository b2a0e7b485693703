use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::error::RewardsError;
use crate::types::{Cycle, CycleId, CycleState, CycleWindow};

/// Where an admitted event belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Cycle(CycleId),
    /// Held until the next cycle opens.
    Deferred,
}

/// Authoritative set of cycles.
///
/// At most one cycle is ever in `{ACTIVE, LOCKING}` and at most one in
/// `{LOCKED, ALLOCATING}`. Transitions follow the lifecycle order strictly.
#[derive(Debug, Default, Clone)]
pub struct CycleRepository {
    cycles: BTreeMap<CycleId, Cycle>,
}

impl CycleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, window: CycleWindow, now: DateTime<Utc>) -> Result<Cycle, RewardsError> {
        if !window.is_valid() {
            return Err(RewardsError::InvariantViolation(format!(
                "cycle window start {} is not before end {}",
                window.start, window.end
            )));
        }
        if let Some(current) = self.admitting() {
            return Err(RewardsError::InvariantViolation(format!(
                "cycle {} is still {}; a new cycle opens once it reaches locked",
                current.cycle_id, current.state
            )));
        }

        let cycle = Cycle {
            cycle_id: CycleId::new(),
            window,
            state: CycleState::Active,
            lock_at: None,
            blocked: None,
            claim_closes_at: None,
            opened_at: now,
            updated_at: now,
        };
        self.cycles.insert(cycle.cycle_id.clone(), cycle.clone());
        Ok(cycle)
    }

    pub fn get(&self, cycle_id: &CycleId) -> Result<&Cycle, RewardsError> {
        self.cycles
            .get(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))
    }

    /// Cycles ordered by window start.
    pub fn list(&self) -> Vec<Cycle> {
        let mut cycles: Vec<Cycle> = self.cycles.values().cloned().collect();
        cycles.sort_by_key(|cycle| (cycle.window.start, cycle.opened_at));
        cycles
    }

    /// The cycle in `ACTIVE` or `LOCKING`, if any.
    pub fn admitting(&self) -> Option<&Cycle> {
        self.cycles.values().find(|cycle| cycle.state.is_admitting())
    }

    /// The cycle in `LOCKED` or `ALLOCATING`, if any.
    pub fn allocating(&self) -> Option<&Cycle> {
        self.cycles.values().find(|cycle| cycle.state.is_allocating())
    }

    pub fn in_state(&self, state: CycleState) -> Vec<Cycle> {
        self.cycles
            .values()
            .filter(|cycle| cycle.state == state)
            .cloned()
            .collect()
    }

    /// Membership is decided here, at admission: only an `ACTIVE` cycle whose window has
    /// not ended accepts events. Events received before the window start are late
    /// deliveries and join the current cycle.
    pub fn attribute(&self, received_at: DateTime<Utc>) -> Attribution {
        match self.admitting() {
            Some(cycle) if cycle.state == CycleState::Active && received_at < cycle.window.end => {
                Attribution::Cycle(cycle.cycle_id.clone())
            }
            _ => Attribution::Deferred,
        }
    }

    /// Move `cycle_id` from `expected` to `next`.
    pub fn advance(
        &mut self,
        cycle_id: &CycleId,
        expected: CycleState,
        next: CycleState,
        now: DateTime<Utc>,
    ) -> Result<Cycle, RewardsError> {
        if !is_edge(expected, next) {
            return Err(RewardsError::transition_violation(
                cycle_id,
                expected.name(),
                next.name(),
            ));
        }
        if next == CycleState::Locked {
            if let Some(other) = self.allocating().filter(|other| other.cycle_id != *cycle_id) {
                return Err(RewardsError::blocked(
                    cycle_id,
                    format!("cycle {} has not finished allocating", other.cycle_id),
                ));
            }
        }

        let cycle = self
            .cycles
            .get_mut(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))?;
        if cycle.state != expected {
            return Err(RewardsError::transition_violation(
                cycle_id,
                expected.name(),
                cycle.state.name(),
            ));
        }
        if let Some(reason) = &cycle.blocked {
            return Err(RewardsError::blocked(cycle_id, reason.clone()));
        }

        cycle.state = next;
        cycle.updated_at = now;
        if next == CycleState::Locking {
            cycle.lock_at = Some(now);
        }
        Ok(cycle.clone())
    }

    pub fn block(
        &mut self,
        cycle_id: &CycleId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Cycle, RewardsError> {
        let cycle = self
            .cycles
            .get_mut(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))?;
        cycle.blocked = Some(reason.into());
        cycle.updated_at = now;
        Ok(cycle.clone())
    }

    /// Clear a block. Returns the reason that was cleared.
    pub fn unblock(
        &mut self,
        cycle_id: &CycleId,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, RewardsError> {
        let cycle = self
            .cycles
            .get_mut(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))?;
        cycle.updated_at = now;
        Ok(cycle.blocked.take())
    }

    pub fn set_claim_closes_at(
        &mut self,
        cycle_id: &CycleId,
        closes_at: DateTime<Utc>,
    ) -> Result<(), RewardsError> {
        let cycle = self
            .cycles
            .get_mut(cycle_id)
            .ok_or_else(|| RewardsError::CycleNotFound(cycle_id.clone()))?;
        cycle.claim_closes_at = Some(closes_at);
        Ok(())
    }
}

fn is_edge(from: CycleState, to: CycleState) -> bool {
    use CycleState::*;
    matches!(
        (from, to),
        (Active, Locking)
            | (Locking, Locked)
            | (Locked, Allocating)
            | (Allocating, Allocated)
            | (Allocated, ClaimOpen)
            | (ClaimOpen, Closed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn window(now: DateTime<Utc>) -> CycleWindow {
        CycleWindow::new(now - Duration::hours(1), now + Duration::hours(1))
    }

    #[test]
    fn only_one_admitting_cycle() {
        let now = Utc::now();
        let mut repo = CycleRepository::new();
        let first = repo.open(window(now), now).unwrap();
        assert!(repo.open(window(now), now).is_err());

        repo.advance(&first.cycle_id, CycleState::Active, CycleState::Locking, now)
            .unwrap();
        assert!(repo.open(window(now), now).is_err());

        repo.advance(&first.cycle_id, CycleState::Locking, CycleState::Locked, now)
            .unwrap();
        assert!(repo.open(window(now), now).is_ok());
    }

    #[test]
    fn second_cycle_cannot_lock_while_first_allocates() {
        let now = Utc::now();
        let mut repo = CycleRepository::new();
        let first = repo.open(window(now), now).unwrap();
        repo.advance(&first.cycle_id, CycleState::Active, CycleState::Locking, now)
            .unwrap();
        repo.advance(&first.cycle_id, CycleState::Locking, CycleState::Locked, now)
            .unwrap();

        let second = repo.open(window(now), now).unwrap();
        repo.advance(&second.cycle_id, CycleState::Active, CycleState::Locking, now)
            .unwrap();
        let err = repo
            .advance(&second.cycle_id, CycleState::Locking, CycleState::Locked, now)
            .unwrap_err();
        assert!(matches!(err, RewardsError::CycleBlocked { .. }));
    }

    #[test]
    fn rejects_skipped_transitions() {
        let now = Utc::now();
        let mut repo = CycleRepository::new();
        let cycle = repo.open(window(now), now).unwrap();
        let err = repo
            .advance(&cycle.cycle_id, CycleState::Active, CycleState::Locked, now)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'active', got 'locked'"));

        let err = repo
            .advance(&cycle.cycle_id, CycleState::Locking, CycleState::Locked, now)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'locking', got 'active'"));
    }

    #[test]
    fn attribution_follows_window_and_state() {
        let now = Utc::now();
        let mut repo = CycleRepository::new();
        assert_eq!(repo.attribute(now), Attribution::Deferred);

        let cycle = repo.open(window(now), now).unwrap();
        assert_eq!(repo.attribute(now), Attribution::Cycle(cycle.cycle_id.clone()));
        assert_eq!(
            repo.attribute(now - Duration::days(3)),
            Attribution::Cycle(cycle.cycle_id.clone())
        );
        assert_eq!(repo.attribute(now + Duration::hours(2)), Attribution::Deferred);

        repo.advance(&cycle.cycle_id, CycleState::Active, CycleState::Locking, now)
            .unwrap();
        assert_eq!(repo.attribute(now), Attribution::Deferred);
    }

    #[test]
    fn blocked_cycles_halt() {
        let now = Utc::now();
        let mut repo = CycleRepository::new();
        let cycle = repo.open(window(now), now).unwrap();
        repo.block(&cycle.cycle_id, "operator hold", now).unwrap();
        assert!(matches!(
            repo.advance(&cycle.cycle_id, CycleState::Active, CycleState::Locking, now),
            Err(RewardsError::CycleBlocked { .. })
        ));
        assert_eq!(
            repo.unblock(&cycle.cycle_id, now).unwrap().as_deref(),
            Some("operator hold")
        );
        assert!(repo
            .advance(&cycle.cycle_id, CycleState::Active, CycleState::Locking, now)
            .is_ok());
    }
}
