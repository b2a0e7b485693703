use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::dispatch::RetryPolicy;
use crate::storage::JournalStorageConfig;

/// Statistic used to fold active suggestions into one resolved amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum AggregationPolicy {
    /// Lower median once `min_suggesters` distinct suggesters exist, else the floor mean.
    MedianOrMean { min_suggesters: usize },
    Mean,
    Median,
}

impl Default for AggregationPolicy {
    fn default() -> Self {
        Self::MedianOrMean { min_suggesters: 3 }
    }
}

/// One reward type code, e.g. `F` for feature requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardTypeEntry {
    pub label: String,
    pub base_amount: u64,
}

/// Reward type codes accepted in place of explicit amounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardCatalog {
    pub entries: BTreeMap<String, RewardTypeEntry>,
    pub max_level: u32,
}

impl RewardCatalog {
    pub fn get(&self, code: &str) -> Option<&RewardTypeEntry> {
        self.entries.get(&code.trim().to_ascii_uppercase())
    }

    /// Resolve `code` at `level` into an amount.
    pub fn amount_for(&self, code: &str, level: u32) -> Option<u64> {
        if level == 0 || level > self.max_level {
            return None;
        }
        self.get(code)
            .and_then(|entry| entry.base_amount.checked_mul(u64::from(level)))
    }

    pub fn label_for(&self, code: &str) -> String {
        let code = code.trim().to_ascii_uppercase();
        match self.entries.get(&code) {
            Some(entry) => entry.label.clone(),
            None => format!("[{code}] Unknown Type"),
        }
    }
}

impl Default for RewardCatalog {
    fn default() -> Self {
        let codes = [
            ("F", "[F] Feature Request"),
            ("B", "[B] Bug Report"),
            ("AT", "[AT] Admin Task"),
            ("CT", "[CT] Content Task"),
            ("IC", "[IC] Issue Creation"),
            ("TWR", "[TWR] Twitter Post"),
            ("D", "[D] Development"),
            ("ER", "[ER] Ecosystem Research"),
        ];
        let entries = codes
            .into_iter()
            .map(|(code, label)| {
                (
                    code.to_string(),
                    RewardTypeEntry {
                        label: label.to_string(),
                        base_amount: 10_000,
                    },
                )
            })
            .collect();
        Self {
            entries,
            max_level: 5,
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub currency_unit: String,
    pub aggregation: AggregationPolicy,
    /// Upper bound on waiting for in-flight aggregation during `LOCKING -> LOCKED`.
    pub lock_barrier_timeout: Duration,
    pub dispatch_retry: RetryPolicy,
    /// Per-attempt timeout for outbound chain dispatch.
    pub dispatch_timeout: Duration,
    /// Trigram similarity at which two unlinked handles are treated as one person.
    pub handle_similarity_threshold: f64,
    /// Handles never credited as contributors; the suggester is credited instead.
    pub excluded_contributors: BTreeSet<String>,
    pub reward_catalog: RewardCatalog,
    pub journal_storage: JournalStorageConfig,
    pub signal_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency_unit: "ASA".to_string(),
            aggregation: AggregationPolicy::default(),
            lock_barrier_timeout: Duration::from_secs(30),
            dispatch_retry: RetryPolicy::default(),
            dispatch_timeout: Duration::from_secs(20),
            handle_similarity_threshold: 0.6,
            excluded_contributors: BTreeSet::new(),
            reward_catalog: RewardCatalog::default(),
            journal_storage: JournalStorageConfig::Memory,
            signal_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn is_excluded(&self, handle: &str) -> bool {
        let handle = handle.trim().trim_start_matches('@').to_lowercase();
        self.excluded_contributors
            .iter()
            .any(|excluded| excluded.trim_start_matches('@').to_lowercase() == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_resolves_code_and_level() {
        let catalog = RewardCatalog::default();
        assert_eq!(catalog.amount_for("f", 2), Some(20_000));
        assert_eq!(catalog.amount_for("F", 0), None);
        assert_eq!(catalog.amount_for("F", 6), None);
        assert_eq!(catalog.amount_for("ZZ", 1), None);
        assert_eq!(catalog.label_for("twr"), "[TWR] Twitter Post");
        assert_eq!(catalog.label_for("zz"), "[ZZ] Unknown Type");
    }

    #[test]
    fn exclusion_ignores_case_and_at_prefix() {
        let mut config = EngineConfig::default();
        config.excluded_contributors.insert("@ProjectBot".to_string());
        assert!(config.is_excluded("projectbot"));
        assert!(config.is_excluded("@PROJECTBOT"));
        assert!(!config.is_excluded("alice"));
    }
}
