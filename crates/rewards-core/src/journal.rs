use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RewardsError;
use crate::types::CycleId;

/// Journal entry types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryKind {
    EventAdmitted,
    EventDeferred,
    Transition,
    Manifest,
    Dispatch,
    Claim,
    ManualResolution,
}

impl JournalEntryKind {
    pub const ALL: [JournalEntryKind; 7] = [
        Self::EventAdmitted,
        Self::EventDeferred,
        Self::Transition,
        Self::Manifest,
        Self::Dispatch,
        Self::Claim,
        Self::ManualResolution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EventAdmitted => "event_admitted",
            Self::EventDeferred => "event_deferred",
            Self::Transition => "transition",
            Self::Manifest => "manifest",
            Self::Dispatch => "dispatch",
            Self::Claim => "claim",
            Self::ManualResolution => "manual_resolution",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RewardsError> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| RewardsError::Journal(format!("unknown journal kind '{value}'")))
    }
}

/// Hash-chained journal entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub entry_id: String,
    pub index: u64,
    pub kind: JournalEntryKind,
    pub cycle_id: Option<CycleId>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

/// Filter used when listing journal entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalQuery {
    pub kind: Option<JournalEntryKind>,
    pub cycle_id: Option<CycleId>,
    pub limit: Option<usize>,
}

impl JournalQuery {
    fn matches(&self, entry: &JournalEntry) -> bool {
        self.kind.map_or(true, |kind| entry.kind == kind)
            && self
                .cycle_id
                .as_ref()
                .map_or(true, |cycle_id| entry.cycle_id.as_ref() == Some(cycle_id))
    }
}

/// Append-only audit journal. No entry is ever rewritten; corrections,
/// transitions and manual overrides all become additional entries.
#[derive(Debug, Default, Clone)]
pub struct AuditJournal {
    entries: Vec<JournalEntry>,
}

impl AuditJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a journal from persisted entries, rejecting index gaps and broken chains.
    pub fn from_entries(entries: Vec<JournalEntry>) -> Result<Self, RewardsError> {
        let journal = Self { entries };

        for (expected_index, entry) in journal.entries.iter().enumerate() {
            if entry.index != expected_index as u64 {
                return Err(RewardsError::Journal(format!(
                    "journal index gap at position {} (found {})",
                    expected_index, entry.index
                )));
            }
        }

        if !journal.verify_chain() {
            return Err(RewardsError::Journal(
                "persisted journal hash-chain verification failed".to_string(),
            ));
        }

        Ok(journal)
    }

    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head_hash(&self) -> Option<&str> {
        self.entries.last().map(|entry| entry.entry_hash.as_str())
    }

    /// Most recent entries first, after filtering.
    pub fn query(&self, query: &JournalQuery) -> Vec<JournalEntry> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.entries
            .iter()
            .rev()
            .filter(|entry| query.matches(entry))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for entry in &self.entries {
            let expected = compute_entry_hash(
                entry.index,
                entry.kind,
                entry.cycle_id.as_ref(),
                entry.timestamp,
                &entry.payload,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected || entry.previous_hash != previous_hash {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    pub fn append(
        &mut self,
        kind: JournalEntryKind,
        cycle_id: Option<&CycleId>,
        payload: Value,
    ) -> Result<JournalEntry, RewardsError> {
        let entry = self.build_entry(kind, cycle_id, payload);
        self.commit_entry(entry.clone())?;
        Ok(entry)
    }

    /// Next chained entry, computed without touching the journal.
    pub fn build_entry(
        &self,
        kind: JournalEntryKind,
        cycle_id: Option<&CycleId>,
        payload: Value,
    ) -> JournalEntry {
        let index = self.entries.len() as u64;
        // Postgres keeps microseconds; hashing finer precision would break rehydration.
        let timestamp = Utc::now().trunc_subsecs(6);
        let previous_hash = self.head_hash().map(str::to_string);
        let entry_hash = compute_entry_hash(
            index,
            kind,
            cycle_id,
            timestamp,
            &payload,
            previous_hash.as_deref(),
        );

        JournalEntry {
            entry_id: Uuid::new_v4().to_string(),
            index,
            kind,
            cycle_id: cycle_id.cloned(),
            timestamp,
            payload,
            previous_hash,
            entry_hash,
        }
    }

    /// Commit a pre-built entry once external durability has succeeded.
    pub fn commit_entry(&mut self, entry: JournalEntry) -> Result<(), RewardsError> {
        let expected_index = self.entries.len() as u64;
        if entry.index != expected_index {
            return Err(RewardsError::Journal(format!(
                "commit index mismatch: expected {}, got {}",
                expected_index, entry.index
            )));
        }
        if entry.previous_hash.as_deref() != self.head_hash() {
            return Err(RewardsError::Journal(
                "commit previous hash mismatch".to_string(),
            ));
        }
        let expected = compute_entry_hash(
            entry.index,
            entry.kind,
            entry.cycle_id.as_ref(),
            entry.timestamp,
            &entry.payload,
            entry.previous_hash.as_deref(),
        );
        if entry.entry_hash != expected {
            return Err(RewardsError::Journal(
                "commit hash mismatch for journal entry".to_string(),
            ));
        }

        self.entries.push(entry);
        Ok(())
    }
}

fn compute_entry_hash(
    index: u64,
    kind: JournalEntryKind,
    cycle_id: Option<&CycleId>,
    timestamp: DateTime<Utc>,
    payload: &Value,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "kind": kind,
        "cycle_id": cycle_id,
        "timestamp": timestamp,
        "payload": payload,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verifies_hash_chain() {
        let mut journal = AuditJournal::new();
        let cycle = CycleId::from("c1");
        journal
            .append(JournalEntryKind::Transition, Some(&cycle), json!({"to": "active"}))
            .unwrap();
        journal
            .append(JournalEntryKind::EventAdmitted, Some(&cycle), json!({"event": "e1"}))
            .unwrap();

        assert!(journal.verify_chain());
        assert_eq!(
            journal.entries()[1].previous_hash.as_deref(),
            Some(journal.entries()[0].entry_hash.as_str())
        );
    }

    #[test]
    fn detects_tampered_entries() {
        let mut journal = AuditJournal::new();
        journal
            .append(JournalEntryKind::Manifest, None, json!({"total": 50}))
            .unwrap();

        let mut tampered = journal.clone();
        tampered.entries[0].payload = json!({"total": 5000});
        assert!(!tampered.verify_chain());
        assert!(AuditJournal::from_entries(tampered.entries).is_err());
    }

    #[test]
    fn rejects_out_of_order_commit() {
        let mut journal = AuditJournal::new();
        let first = journal.build_entry(JournalEntryKind::Claim, None, json!({}));
        journal.commit_entry(first.clone()).unwrap();
        assert!(journal.commit_entry(first).is_err());
    }

    #[test]
    fn query_filters_newest_first() {
        let mut journal = AuditJournal::new();
        let c1 = CycleId::from("c1");
        let c2 = CycleId::from("c2");
        journal.append(JournalEntryKind::Transition, Some(&c1), json!(1)).unwrap();
        journal.append(JournalEntryKind::Transition, Some(&c2), json!(2)).unwrap();
        journal.append(JournalEntryKind::Dispatch, Some(&c1), json!(3)).unwrap();
        journal.append(JournalEntryKind::Transition, Some(&c1), json!(4)).unwrap();

        let hits = journal.query(&JournalQuery {
            kind: Some(JournalEntryKind::Transition),
            cycle_id: Some(c1),
            limit: None,
        });
        let payloads: Vec<_> = hits.iter().map(|entry| entry.payload.clone()).collect();
        assert_eq!(payloads, vec![json!(4), json!(1)]);

        let limited = journal.query(&JournalQuery {
            limit: Some(2),
            ..JournalQuery::default()
        });
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].index, 3);
    }

    #[test]
    fn kind_names_roundtrip() {
        for kind in JournalEntryKind::ALL {
            assert_eq!(JournalEntryKind::parse(kind.as_str()).unwrap(), kind);
        }
    }
}
