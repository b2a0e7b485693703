use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::{EventId, Lineage, RawEvent};

/// Result of checking an event against previously admitted deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "event_id")]
pub enum DedupOutcome {
    /// First delivery of this lineage.
    Fresh,
    /// Same lineage, new content. Carries the latest prior event it supersedes.
    Superseding(EventId),
    /// Identical content already admitted as the carried event.
    Duplicate(EventId),
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }

    pub fn superseded(&self) -> Option<&EventId> {
        match self {
            Self::Superseding(previous) => Some(previous),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct LineageEntry {
    content_hash: String,
    event_id: EventId,
}

/// Lineage index keyed by `(provider, external_id)`.
///
/// The check-and-insert happens under the shard lock of the lineage key, so two
/// concurrent deliveries of the same event can never both be admitted.
#[derive(Debug, Default)]
pub struct DedupIndex {
    lineages: DashMap<Lineage, Vec<LineageEntry>>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&self, event: &RawEvent) -> DedupOutcome {
        let mut entries = self.lineages.entry(event.lineage()).or_default();
        if let Some(existing) = entries
            .iter()
            .find(|entry| entry.content_hash == event.content_hash)
        {
            return DedupOutcome::Duplicate(existing.event_id.clone());
        }

        let outcome = match entries.last() {
            Some(previous) => DedupOutcome::Superseding(previous.event_id.clone()),
            None => DedupOutcome::Fresh,
        };
        entries.push(LineageEntry {
            content_hash: event.content_hash.clone(),
            event_id: event.event_id.clone(),
        });
        outcome
    }

    /// Forget a delivery whose admission failed after the dedup check, so a
    /// redelivery is judged afresh.
    pub fn retract(&self, event: &RawEvent) {
        if let Some(mut entries) = self.lineages.get_mut(&event.lineage()) {
            entries.retain(|entry| entry.event_id != event.event_id);
        }
    }

    /// Latest admitted event of a lineage.
    pub fn latest(&self, lineage: &Lineage) -> Option<EventId> {
        self.lineages
            .get(lineage)
            .and_then(|entries| entries.last().map(|entry| entry.event_id.clone()))
    }

    pub fn deliveries(&self, lineage: &Lineage) -> usize {
        self.lineages.get(lineage).map_or(0, |entries| entries.len())
    }

    pub fn len(&self) -> usize {
        self.lineages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lineages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CorrelationKey, EventKind, EventPayload, Handle, Platform, ProviderKind};
    use chrono::Utc;
    use std::sync::Arc;

    fn event(external_id: &str, hash: &str) -> RawEvent {
        RawEvent {
            event_id: EventId::new(),
            provider: ProviderKind::Github,
            external_id: external_id.to_string(),
            author_identity: Handle::new(Platform::Github, "alice"),
            kind: EventKind::Contribution,
            payload: EventPayload {
                correlation_key: CorrelationKey::issue(1),
                contributor: None,
                amount: None,
                reward_type: None,
                description: String::new(),
                body: String::new(),
                url: None,
                source_created_at: None,
                raw: serde_json::Value::Null,
            },
            received_at: Utc::now(),
            content_hash: hash.to_string(),
        }
    }

    #[test]
    fn identical_redelivery_is_duplicate() {
        let index = DedupIndex::new();
        let first = event("7", "h1");
        assert_eq!(index.admit(&first), DedupOutcome::Fresh);
        assert_eq!(
            index.admit(&event("7", "h1")),
            DedupOutcome::Duplicate(first.event_id.clone())
        );
        assert_eq!(index.deliveries(&first.lineage()), 1);
    }

    #[test]
    fn changed_content_supersedes_latest() {
        let index = DedupIndex::new();
        let first = event("7", "h1");
        let second = event("7", "h2");
        index.admit(&first);
        assert_eq!(
            index.admit(&second),
            DedupOutcome::Superseding(first.event_id.clone())
        );
        // Re-delivery of the original body is still a duplicate of the original.
        assert_eq!(
            index.admit(&event("7", "h1")),
            DedupOutcome::Duplicate(first.event_id)
        );
        assert_eq!(index.latest(&second.lineage()), Some(second.event_id));
    }

    #[test]
    fn retracted_delivery_is_admitted_again() {
        let index = DedupIndex::new();
        let rejected = event("9", "h1");
        assert_eq!(index.admit(&rejected), DedupOutcome::Fresh);
        index.retract(&rejected);
        assert_eq!(index.admit(&event("9", "h1")), DedupOutcome::Fresh);
        assert_eq!(index.deliveries(&rejected.lineage()), 1);
    }

    #[test]
    fn concurrent_deliveries_admit_exactly_once() {
        let index = Arc::new(DedupIndex::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let index = Arc::clone(&index);
                std::thread::spawn(move || index.admit(&event("42", "same")))
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|outcome| *outcome == DedupOutcome::Fresh)
            .count();
        assert_eq!(fresh, 1);
        assert_eq!(index.len(), 1);
    }
}
