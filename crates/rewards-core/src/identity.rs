//! Identity linkage: handle to contributor, contributor to claim address.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::RewardsError;
use crate::types::{ContributorId, Handle};

/// Outbound identity collaborator.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Explicitly linked contributor of `handle`, if any.
    async fn contributor_for(&self, handle: &Handle) -> Result<Option<ContributorId>, RewardsError>;

    /// Every address `contributor` has claimed. More than one is contradictory.
    async fn address_claims(&self, contributor: &ContributorId)
        -> Result<BTreeSet<String>, RewardsError>;

    /// Single claimed address, or `None` when unresolved or contradictory.
    async fn resolve_address(&self, contributor: &ContributorId) -> Result<Option<String>, RewardsError> {
        let claims = self.address_claims(contributor).await?;
        if claims.len() == 1 {
            Ok(claims.into_iter().next())
        } else {
            Ok(None)
        }
    }
}

/// Resolved identity facts about one handle, captured before reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityView {
    pub handle: Handle,
    pub contributor_id: ContributorId,
    pub linked: bool,
    pub claims: BTreeSet<String>,
}

impl IdentityView {
    pub fn address(&self) -> Option<&str> {
        if self.claims.len() == 1 {
            self.claims.iter().next().map(String::as_str)
        } else {
            None
        }
    }
}

/// Point-in-time identity lookup results so reconciliation can stay synchronous.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    views: BTreeMap<Handle, IdentityView>,
}

impl IdentitySnapshot {
    pub async fn capture<'a, D, I>(directory: &D, handles: I) -> Result<Self, RewardsError>
    where
        D: IdentityDirectory + ?Sized,
        I: IntoIterator<Item = &'a Handle>,
    {
        let mut views = BTreeMap::new();
        for handle in handles {
            if views.contains_key(handle) {
                continue;
            }
            let linked = directory.contributor_for(handle).await?;
            let contributor_id = linked
                .clone()
                .unwrap_or_else(|| handle.unlinked_contributor());
            let claims = directory.address_claims(&contributor_id).await?;
            views.insert(
                handle.clone(),
                IdentityView {
                    handle: handle.clone(),
                    contributor_id,
                    linked: linked.is_some(),
                    claims,
                },
            );
        }
        Ok(Self { views })
    }

    pub fn view(&self, handle: &Handle) -> Option<&IdentityView> {
        self.views.get(handle)
    }

    pub fn views(&self) -> impl Iterator<Item = &IdentityView> {
        self.views.values()
    }

    /// Apply operator resolutions: each contributor gets exactly the given address.
    pub fn with_resolutions(mut self, resolutions: &BTreeMap<ContributorId, String>) -> Self {
        for view in self.views.values_mut() {
            if let Some(address) = resolutions.get(&view.contributor_id) {
                view.claims = BTreeSet::from([address.clone()]);
            }
        }
        self
    }
}

/// In-memory identity directory.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    links: DashMap<Handle, ContributorId>,
    claims: DashMap<ContributorId, BTreeSet<String>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self, handle: Handle, contributor: ContributorId) {
        self.links.insert(handle, contributor);
    }

    pub fn claim_address(
        &self,
        contributor: &ContributorId,
        address: &str,
    ) -> Result<(), RewardsError> {
        let address = address.trim();
        if address.is_empty() {
            return Err(RewardsError::Identity(format!(
                "empty address claimed by {contributor}"
            )));
        }
        self.claims
            .entry(contributor.clone())
            .or_default()
            .insert(address.to_string());
        Ok(())
    }

    /// Claim an address for whatever contributor `handle` currently maps to.
    pub fn claim_for_handle(&self, handle: &Handle, address: &str) -> Result<ContributorId, RewardsError> {
        let contributor = self
            .links
            .get(handle)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| handle.unlinked_contributor());
        self.claim_address(&contributor, address)?;
        Ok(contributor)
    }

    /// Replace every claim of `contributor` with `address`.
    pub fn settle_address(&self, contributor: &ContributorId, address: &str) -> Result<(), RewardsError> {
        self.claims.remove(contributor);
        self.claim_address(contributor, address)
    }
}

#[async_trait]
impl IdentityDirectory for IdentityRegistry {
    async fn contributor_for(&self, handle: &Handle) -> Result<Option<ContributorId>, RewardsError> {
        Ok(self.links.get(handle).map(|entry| entry.value().clone()))
    }

    async fn address_claims(
        &self,
        contributor: &ContributorId,
    ) -> Result<BTreeSet<String>, RewardsError> {
        Ok(self
            .claims
            .get(contributor)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }
}

/// Trigram similarity of two handle names in `[0, 1]`, padded the way `pg_trgm` pads words.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let left = trigrams(a);
    let right = trigrams(b);
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let shared = left.intersection(&right).count();
    let total = left.union(&right).count();
    shared as f64 / total as f64
}

fn trigrams(value: &str) -> BTreeSet<[char; 3]> {
    let mut set = BTreeSet::new();
    for word in value
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        let padded: Vec<char> = "  ".chars().chain(word.chars()).chain(" ".chars()).collect();
        for window in padded.windows(3) {
            set.insert([window[0], window[1], window[2]]);
        }
    }
    set
}
