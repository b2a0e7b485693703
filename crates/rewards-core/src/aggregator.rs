use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::config::AggregationPolicy;
use crate::error::RewardsError;
use crate::types::{
    Contribution, ContributionId, ContributionStatus, ContributorId, CorrelationKey, CycleId,
    EventKind, Lineage, RawEvent, Suggestion,
};

/// Outcome of folding one event into its contribution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub contribution_id: ContributionId,
    pub created: bool,
    pub active_suggestions: usize,
    pub resolved_amount: Option<u64>,
}

/// Contribution plus its currently active suggestions and resolved amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedContribution {
    pub contribution: Contribution,
    pub active_suggestions: Vec<Suggestion>,
    pub resolved_amount: Option<u64>,
}

#[derive(Debug, Clone)]
struct LoggedSuggestion {
    suggestion: Suggestion,
    lineage: Lineage,
}

#[derive(Debug, Clone)]
struct ContributionState {
    contribution: Contribution,
    /// Append-only; never rewritten.
    log: Vec<LoggedSuggestion>,
    last_detail_seq: Option<u64>,
}

type ContributionKey = (CycleId, CorrelationKey);

/// Per-cycle count of admitted events whose aggregation has not finished yet.
#[derive(Debug, Default)]
pub struct QuiescenceBarrier {
    counts: DashMap<CycleId, usize>,
    settled: Notify,
}

impl QuiescenceBarrier {
    pub fn in_flight(&self, cycle_id: &CycleId) -> usize {
        self.counts.get(cycle_id).map_or(0, |count| *count)
    }

    /// Wait until no aggregation for `cycle_id` is in flight.
    pub async fn wait_quiescent(&self, cycle_id: &CycleId) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight(cycle_id) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn enter(&self, cycle_id: &CycleId) {
        *self.counts.entry(cycle_id.clone()).or_default() += 1;
    }

    fn leave(&self, cycle_id: &CycleId) {
        if let Some(mut count) = self.counts.get_mut(cycle_id) {
            *count = count.saturating_sub(1);
        }
        self.settled.notify_waiters();
    }
}

/// Marks one admitted event as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    barrier: Arc<QuiescenceBarrier>,
    cycle_id: CycleId,
}

impl InFlightGuard {
    pub fn cycle_id(&self) -> &CycleId {
        &self.cycle_id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.barrier.leave(&self.cycle_id);
    }
}

/// Groups events into contributions and resolves suggestion amounts.
#[derive(Debug)]
pub struct ContributionAggregator {
    policy: AggregationPolicy,
    currency_unit: String,
    contributions: DashMap<ContributionKey, ContributionState>,
    by_id: DashMap<ContributionId, ContributionKey>,
    lineage_heads: DashMap<(CycleId, Lineage), u64>,
    barrier: Arc<QuiescenceBarrier>,
}

impl ContributionAggregator {
    pub fn new(policy: AggregationPolicy, currency_unit: impl Into<String>) -> Self {
        Self {
            policy,
            currency_unit: currency_unit.into(),
            contributions: DashMap::new(),
            by_id: DashMap::new(),
            lineage_heads: DashMap::new(),
            barrier: Arc::new(QuiescenceBarrier::default()),
        }
    }

    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    pub fn barrier(&self) -> &QuiescenceBarrier {
        &self.barrier
    }

    /// Register an admitted event as in flight for `cycle_id`.
    pub fn track(&self, cycle_id: &CycleId) -> InFlightGuard {
        self.barrier.enter(cycle_id);
        InFlightGuard {
            barrier: Arc::clone(&self.barrier),
            cycle_id: cycle_id.clone(),
        }
    }

    /// Reject events this aggregator can never fold, before anything is committed.
    pub fn validate(&self, event: &RawEvent) -> Result<(), RewardsError> {
        match &event.payload.amount {
            Some(amount) if amount.currency_unit != self.currency_unit => {
                Err(RewardsError::malformed(
                    event.provider.name(),
                    format!(
                        "currency unit '{}' is not '{}'",
                        amount.currency_unit, self.currency_unit
                    ),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Fold `event` into the contribution for its correlation key within `cycle_id`,
    /// crediting any suggestion to the author's unlinked identity.
    pub fn ingest(
        &self,
        cycle_id: &CycleId,
        event: &RawEvent,
        seq: u64,
    ) -> Result<AggregationResult, RewardsError> {
        self.ingest_as(cycle_id, event, seq, event.author_identity.unlinked_contributor())
    }

    /// Like [`ContributionAggregator::ingest`], with the suggester already resolved to
    /// its linked contributor so one person's handles share a single vote.
    ///
    /// `seq` is the admission sequence number; it orders corrections within a lineage
    /// and breaks suggestion timestamp ties.
    pub fn ingest_as(
        &self,
        cycle_id: &CycleId,
        event: &RawEvent,
        seq: u64,
        suggester: ContributorId,
    ) -> Result<AggregationResult, RewardsError> {
        self.validate(event)?;
        let lineage = event.lineage();

        let key = (cycle_id.clone(), event.payload.correlation_key.clone());
        let mut created = false;
        let mut state = self.contributions.entry(key.clone()).or_insert_with(|| {
            created = true;
            ContributionState {
                contribution: Contribution {
                    contribution_id: ContributionId::new(),
                    cycle_id: cycle_id.clone(),
                    correlation_key: event.payload.correlation_key.clone(),
                    contributor: None,
                    source_refs: BTreeSet::new(),
                    description: String::new(),
                    reward_type: None,
                    url: None,
                    created_at: event.received_at,
                    status: ContributionStatus::Open,
                },
                log: Vec::new(),
                last_detail_seq: None,
            }
        });

        if state.contribution.status == ContributionStatus::Locked {
            return Err(RewardsError::InvariantViolation(format!(
                "contribution {} is locked",
                state.contribution.contribution_id
            )));
        }
        self.lineage_heads
            .entry((cycle_id.clone(), lineage.clone()))
            .and_modify(|head| *head = (*head).max(seq))
            .or_insert(seq);

        apply_details(&mut state, event, seq);
        state.contribution.source_refs.insert(event.event_id.clone());

        if let Some(amount) = &event.payload.amount {
            let suggestion = Suggestion {
                contribution_id: state.contribution.contribution_id.clone(),
                suggester_identity: suggester,
                amount: amount.amount,
                currency_unit: amount.currency_unit.clone(),
                created_at: event.effective_created_at(),
                source_event: event.event_id.clone(),
                ingest_seq: seq,
            };
            state.log.push(LoggedSuggestion { suggestion, lineage });
        }

        let active = self.active_suggestions(cycle_id, &state.log);
        state.contribution.status = if active.is_empty() {
            ContributionStatus::Open
        } else {
            ContributionStatus::Suggested
        };
        let contribution_id = state.contribution.contribution_id.clone();
        drop(state);

        if created {
            self.by_id.insert(contribution_id.clone(), key);
        }

        Ok(AggregationResult {
            contribution_id,
            created,
            active_suggestions: active.len(),
            resolved_amount: resolve_amount(self.policy, &active),
        })
    }

    /// Freeze every contribution of `cycle_id`.
    pub fn lock_cycle(&self, cycle_id: &CycleId) -> usize {
        let mut locked = 0;
        for mut state in self.contributions.iter_mut() {
            if state.key().0 == *cycle_id {
                state.contribution.status = ContributionStatus::Locked;
                locked += 1;
            }
        }
        locked
    }

    pub fn contribution(&self, contribution_id: &ContributionId) -> Option<ResolvedContribution> {
        let key = self.by_id.get(contribution_id)?.value().clone();
        let state = self.contributions.get(&key)?;
        Some(self.resolve(&key.0, &state))
    }

    pub fn contributions(&self, cycle_id: &CycleId) -> Vec<ResolvedContribution> {
        let mut resolved: Vec<ResolvedContribution> = self
            .contributions
            .iter()
            .filter(|state| state.key().0 == *cycle_id)
            .map(|state| self.resolve(cycle_id, state.value()))
            .collect();
        resolved.sort_by(|a, b| {
            a.contribution
                .correlation_key
                .cmp(&b.contribution.correlation_key)
        });
        resolved
    }

    pub fn contribution_count(&self, cycle_id: &CycleId) -> usize {
        self.contributions
            .iter()
            .filter(|state| state.key().0 == *cycle_id)
            .count()
    }

    /// Full append-only suggestion log of a contribution, superseded entries included.
    pub fn suggestion_log(&self, contribution_id: &ContributionId) -> Vec<Suggestion> {
        self.by_id
            .get(contribution_id)
            .map(|key| key.value().clone())
            .and_then(|key| self.contributions.get(&key))
            .map(|state| state.log.iter().map(|logged| logged.suggestion.clone()).collect())
            .unwrap_or_default()
    }

    fn resolve(&self, cycle_id: &CycleId, state: &ContributionState) -> ResolvedContribution {
        let active = self.active_suggestions(cycle_id, &state.log);
        ResolvedContribution {
            contribution: state.contribution.clone(),
            resolved_amount: resolve_amount(self.policy, &active),
            active_suggestions: active,
        }
    }

    fn active_suggestions(&self, cycle_id: &CycleId, log: &[LoggedSuggestion]) -> Vec<Suggestion> {
        let current: Vec<Suggestion> = log
            .iter()
            .filter(|logged| {
                self.lineage_heads
                    .get(&(cycle_id.clone(), logged.lineage.clone()))
                    .map_or(true, |head| *head == logged.suggestion.ingest_seq)
            })
            .map(|logged| logged.suggestion.clone())
            .collect();
        select_latest(&current)
    }
}

/// Contribution and correction events overwrite details in admission order; suggestions
/// only fill details that are still missing.
fn apply_details(state: &mut ContributionState, event: &RawEvent, seq: u64) {
    let contribution = &mut state.contribution;
    let payload = &event.payload;
    match event.kind {
        EventKind::Contribution | EventKind::Correction => {
            if state.last_detail_seq.map_or(false, |last| last > seq) {
                return;
            }
            state.last_detail_seq = Some(seq);
            if payload.contributor.is_some() {
                contribution.contributor = payload.contributor.clone();
            }
            if !payload.description.is_empty() {
                contribution.description = payload.description.clone();
            }
            if payload.reward_type.is_some() {
                contribution.reward_type = payload.reward_type.clone();
            }
            if payload.url.is_some() {
                contribution.url = payload.url.clone();
            }
        }
        EventKind::Suggestion => {
            if contribution.contributor.is_none() {
                contribution.contributor = payload.contributor.clone();
            }
            if contribution.description.is_empty() {
                contribution.description = payload.description.clone();
            }
            if contribution.reward_type.is_none() {
                contribution.reward_type = payload.reward_type.clone();
            }
            if contribution.url.is_none() {
                contribution.url = payload.url.clone();
            }
        }
    }
}

/// Last-write-wins per suggester, ordered by `(created_at, ingest_seq)`.
pub fn select_latest(log: &[Suggestion]) -> Vec<Suggestion> {
    let mut latest: BTreeMap<&ContributorId, &Suggestion> = BTreeMap::new();
    for suggestion in log {
        latest
            .entry(&suggestion.suggester_identity)
            .and_modify(|current| {
                if write_order(suggestion) > write_order(*current) {
                    *current = suggestion;
                }
            })
            .or_insert(suggestion);
    }
    latest.into_values().cloned().collect()
}

fn write_order(suggestion: &Suggestion) -> (DateTime<Utc>, u64) {
    (suggestion.created_at, suggestion.ingest_seq)
}

/// Resolve one amount from active suggestions. Amounts are sorted by
/// `(amount, suggester_identity)` so the lower median is deterministic.
pub fn resolve_amount(policy: AggregationPolicy, suggestions: &[Suggestion]) -> Option<u64> {
    if suggestions.is_empty() {
        return None;
    }
    let mut ordered: Vec<(u64, &ContributorId)> = suggestions
        .iter()
        .map(|s| (s.amount, &s.suggester_identity))
        .collect();
    ordered.sort();

    let median = || ordered[(ordered.len() - 1) / 2].0;
    let mean = || {
        let sum: u128 = ordered.iter().map(|(amount, _)| u128::from(*amount)).sum();
        (sum / ordered.len() as u128) as u64
    };
    let distinct = ordered
        .iter()
        .map(|(_, suggester)| *suggester)
        .collect::<BTreeSet<_>>()
        .len();

    Some(match policy {
        AggregationPolicy::MedianOrMean { min_suggesters } if distinct >= min_suggesters => median(),
        AggregationPolicy::MedianOrMean { .. } | AggregationPolicy::Mean => mean(),
        AggregationPolicy::Median => median(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventId, EventPayload, Handle, Platform, ProviderKind, SuggestedAmount};
    use chrono::Duration;

    fn suggestion(suggester: &str, amount: u64) -> Suggestion {
        Suggestion {
            contribution_id: ContributionId::from("k"),
            suggester_identity: ContributorId::from(suggester),
            amount,
            currency_unit: "ASA".to_string(),
            created_at: Utc::now(),
            source_event: EventId::new(),
            ingest_seq: 0,
        }
    }

    fn suggest_event(external_id: &str, author: &str, amount: u64, at: DateTime<Utc>) -> RawEvent {
        RawEvent {
            event_id: EventId::new(),
            provider: ProviderKind::DiscordBot,
            external_id: external_id.to_string(),
            author_identity: Handle::new(Platform::Discord, author),
            kind: EventKind::Suggestion,
            payload: EventPayload {
                correlation_key: CorrelationKey::issue(7),
                contributor: None,
                amount: Some(SuggestedAmount {
                    amount,
                    currency_unit: "ASA".to_string(),
                }),
                reward_type: None,
                description: String::new(),
                body: String::new(),
                url: None,
                source_created_at: Some(at),
                raw: serde_json::Value::Null,
            },
            received_at: at,
            content_hash: format!("{external_id}-{amount}"),
        }
    }

    #[test]
    fn median_with_three_suggesters_mean_below() {
        let policy = AggregationPolicy::default();
        let three = [suggestion("a", 10), suggestion("b", 20), suggestion("c", 30)];
        assert_eq!(resolve_amount(policy, &three), Some(20));
        let two = [suggestion("a", 10), suggestion("b", 20)];
        assert_eq!(resolve_amount(policy, &two), Some(15));
        assert_eq!(resolve_amount(policy, &[]), None);
    }

    #[test]
    fn even_count_takes_lower_median() {
        let four = [
            suggestion("a", 40),
            suggestion("b", 10),
            suggestion("c", 30),
            suggestion("d", 20),
        ];
        assert_eq!(resolve_amount(AggregationPolicy::default(), &four), Some(20));
        assert_eq!(resolve_amount(AggregationPolicy::Mean, &four), Some(25));
    }

    #[test]
    fn latest_suggestion_per_suggester_wins() {
        let now = Utc::now();
        let mut first = suggestion("a", 10);
        first.created_at = now;
        let mut second = suggestion("a", 99);
        second.created_at = now;
        second.ingest_seq = 1;
        let mut stale = suggestion("a", 1);
        stale.created_at = now - Duration::seconds(5);
        stale.ingest_seq = 2;

        let latest = select_latest(&[first, second, stale]);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].amount, 99);
    }

    #[test]
    fn correction_replaces_prior_suggestion_value() {
        let aggregator = ContributionAggregator::new(AggregationPolicy::default(), "ASA");
        let cycle = CycleId::from("c1");
        let now = Utc::now();

        let original = suggest_event("42", "bob", 10, now);
        let first = aggregator.ingest(&cycle, &original, 1).unwrap();
        assert!(first.created);

        let corrected = suggest_event("42", "bob", 30, now - Duration::seconds(1));
        let second = aggregator.ingest(&cycle, &corrected, 2).unwrap();
        assert!(!second.created);
        assert_eq!(second.active_suggestions, 1);
        assert_eq!(second.resolved_amount, Some(30));

        let resolved = aggregator.contribution(&first.contribution_id).unwrap();
        assert_eq!(resolved.contribution.source_refs.len(), 2);
        assert_eq!(resolved.contribution.status, ContributionStatus::Suggested);
        assert_eq!(aggregator.suggestion_log(&first.contribution_id).len(), 2);
    }

    #[test]
    fn linked_handles_share_one_vote() {
        let aggregator = ContributionAggregator::new(AggregationPolicy::default(), "ASA");
        let cycle = CycleId::from("c1");
        let alice = ContributorId::from("alice");
        let now = Utc::now();

        let mut from_github = suggest_event("g-1", "alice", 10, now - Duration::seconds(2));
        from_github.author_identity = Handle::new(Platform::Github, "alice");
        aggregator
            .ingest_as(&cycle, &from_github, 1, alice.clone())
            .unwrap();
        aggregator
            .ingest_as(
                &cycle,
                &suggest_event("d-1", "alice", 100, now - Duration::seconds(1)),
                2,
                alice,
            )
            .unwrap();
        let result = aggregator
            .ingest(&cycle, &suggest_event("d-2", "bob", 20, now), 3)
            .unwrap();

        assert_eq!(result.active_suggestions, 2);
        assert_eq!(result.resolved_amount, Some(60));
    }

    #[test]
    fn foreign_currency_is_rejected_before_folding() {
        let aggregator = ContributionAggregator::new(AggregationPolicy::default(), "ASA");
        let cycle = CycleId::from("c1");
        let mut event = suggest_event("1", "bob", 5, Utc::now());
        if let Some(amount) = event.payload.amount.as_mut() {
            amount.currency_unit = "XYZ".to_string();
        }
        assert!(matches!(
            aggregator.validate(&event),
            Err(RewardsError::MalformedPayload { .. })
        ));
        assert!(aggregator.ingest(&cycle, &event, 1).is_err());
        assert_eq!(aggregator.contribution_count(&cycle), 0);
    }

    #[test]
    fn locked_contributions_reject_ingest() {
        let aggregator = ContributionAggregator::new(AggregationPolicy::default(), "ASA");
        let cycle = CycleId::from("c1");
        aggregator
            .ingest(&cycle, &suggest_event("1", "bob", 5, Utc::now()), 1)
            .unwrap();
        assert_eq!(aggregator.lock_cycle(&cycle), 1);
        assert!(aggregator
            .ingest(&cycle, &suggest_event("2", "eve", 5, Utc::now()), 2)
            .is_err());
    }

    #[tokio::test]
    async fn barrier_releases_when_guards_drop() {
        let aggregator = ContributionAggregator::new(AggregationPolicy::default(), "ASA");
        let cycle = CycleId::from("c1");
        let guard = aggregator.track(&cycle);
        assert_eq!(aggregator.barrier().in_flight(&cycle), 1);

        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            aggregator.barrier().wait_quiescent(&cycle),
        )
        .await;
        assert!(waited.is_err());

        drop(guard);
        tokio::time::timeout(
            std::time::Duration::from_millis(200),
            aggregator.barrier().wait_quiescent(&cycle),
        )
        .await
        .unwrap();
    }
}
