use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};

use crate::aggregator::ResolvedContribution;
use crate::error::RewardsError;
use crate::identity::{trigram_similarity, IdentitySnapshot, IdentityView};
use crate::types::{
    Allocation, AllocationManifest, ContributionId, ContributorId, CycleId, IdentityConflict,
    UnallocatedContribution, UnallocatedReason,
};

/// Everything reconciliation reads. Identity lookups are captured up front so the
/// computation itself is synchronous and deterministic.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInput<'a> {
    pub cycle_id: &'a CycleId,
    pub currency_unit: &'a str,
    pub contributions: &'a [ResolvedContribution],
    pub identities: &'a IdentitySnapshot,
    pub similarity_threshold: f64,
    /// Contributors whose address an operator settled; exempt from similarity checks.
    pub resolved: &'a BTreeSet<ContributorId>,
    pub created_at: DateTime<Utc>,
}

struct Candidate<'a> {
    contribution_id: &'a ContributionId,
    view: &'a IdentityView,
    amount: u64,
}

/// Compute the allocation manifest for one cycle.
///
/// Conflicted contributors are reported and skipped; everyone else is allocated. Fails
/// with `IdentityConflict` only when conflicts leave nothing to allocate, and with
/// `EmptyCycle` when there was nothing allocatable to begin with.
pub fn reconcile(input: ReconcileInput<'_>) -> Result<AllocationManifest, RewardsError> {
    let mut unallocated = Vec::new();
    let mut candidates = Vec::new();

    for resolved in input.contributions {
        let contribution = &resolved.contribution;
        let Some(amount) = resolved.resolved_amount else {
            unallocated.push(UnallocatedContribution {
                contribution_id: contribution.contribution_id.clone(),
                contributor: contribution
                    .contributor
                    .as_ref()
                    .map(|handle| handle.unlinked_contributor()),
                reason: UnallocatedReason::NoSuggestions,
            });
            continue;
        };
        let Some(handle) = &contribution.contributor else {
            unallocated.push(UnallocatedContribution {
                contribution_id: contribution.contribution_id.clone(),
                contributor: None,
                reason: UnallocatedReason::MissingContributor,
            });
            continue;
        };
        match input.identities.view(handle) {
            Some(view) => candidates.push(Candidate {
                contribution_id: &contribution.contribution_id,
                view,
                amount,
            }),
            None => unallocated.push(UnallocatedContribution {
                contribution_id: contribution.contribution_id.clone(),
                contributor: Some(handle.unlinked_contributor()),
                reason: UnallocatedReason::UnresolvedAddress,
            }),
        }
    }

    let conflicts = detect_conflicts(&candidates, input.similarity_threshold, input.resolved);
    let conflicted: BTreeSet<&ContributorId> = conflicts
        .iter()
        .flat_map(|conflict| conflict.contributors.iter())
        .collect();

    let mut totals: BTreeMap<String, (u64, BTreeSet<ContributionId>)> = BTreeMap::new();
    for candidate in &candidates {
        if conflicted.contains(&candidate.view.contributor_id) {
            continue;
        }
        let Some(address) = candidate.view.address() else {
            unallocated.push(UnallocatedContribution {
                contribution_id: candidate.contribution_id.clone(),
                contributor: Some(candidate.view.contributor_id.clone()),
                reason: UnallocatedReason::UnresolvedAddress,
            });
            continue;
        };
        let (total, set) = totals.entry(address.to_string()).or_default();
        *total = total.checked_add(candidate.amount).ok_or_else(|| {
            RewardsError::InvariantViolation(format!("allocation overflow for {address}"))
        })?;
        set.insert(candidate.contribution_id.clone());
    }

    if totals.is_empty() {
        if !conflicts.is_empty() {
            return Err(RewardsError::IdentityConflict(conflicts));
        }
        return Err(RewardsError::EmptyCycle(input.cycle_id.clone()));
    }

    let allocations: Vec<Allocation> = totals
        .into_iter()
        .map(|(address, (total_amount, contributing_set))| Allocation {
            cycle_id: input.cycle_id.clone(),
            contributor_address: address,
            total_amount,
            contributing_set,
        })
        .collect();
    let total_amount = allocations
        .iter()
        .try_fold(0u64, |sum, allocation| sum.checked_add(allocation.total_amount))
        .ok_or_else(|| RewardsError::InvariantViolation("manifest total overflow".to_string()))?;
    unallocated.sort_by(|a, b| a.contribution_id.cmp(&b.contribution_id));

    let manifest_hash = manifest_hash(
        input.cycle_id,
        input.currency_unit,
        &allocations,
        &conflicts,
        &unallocated,
    )?;

    Ok(AllocationManifest {
        cycle_id: input.cycle_id.clone(),
        currency_unit: input.currency_unit.to_string(),
        allocations,
        conflicts,
        unallocated,
        total_amount,
        manifest_hash,
        created_at: input.created_at,
    })
}

fn detect_conflicts(
    candidates: &[Candidate<'_>],
    threshold: f64,
    resolved: &BTreeSet<ContributorId>,
) -> Vec<IdentityConflict> {
    let mut views: BTreeMap<&ContributorId, Vec<&IdentityView>> = BTreeMap::new();
    for candidate in candidates {
        views
            .entry(&candidate.view.contributor_id)
            .or_default()
            .push(candidate.view);
    }

    let mut groups = UnionFind::default();
    let mut reasons: BTreeMap<&ContributorId, &'static str> = BTreeMap::new();

    for (contributor, contributor_views) in &views {
        if contributor_views.iter().any(|view| view.claims.len() > 1) {
            groups.add(contributor);
            reasons.insert(contributor, "contradictory address claims");
        }
    }

    let unlinked: Vec<&IdentityView> = views
        .iter()
        .filter(|(contributor, _)| !resolved.contains(**contributor))
        .flat_map(|(_, contributor_views)| contributor_views.iter().copied())
        .filter(|view| !view.linked && view.address().is_some())
        .collect();
    for (i, left) in unlinked.iter().enumerate() {
        for right in &unlinked[i + 1..] {
            if left.contributor_id == right.contributor_id || left.address() == right.address() {
                continue;
            }
            if trigram_similarity(&left.handle.name, &right.handle.name) >= threshold {
                groups.union(&left.contributor_id, &right.contributor_id);
                reasons
                    .entry(&left.contributor_id)
                    .or_insert("similar unlinked handles claim different addresses");
                reasons
                    .entry(&right.contributor_id)
                    .or_insert("similar unlinked handles claim different addresses");
            }
        }
    }

    let mut conflicts: BTreeMap<&ContributorId, IdentityConflict> = BTreeMap::new();
    for (contributor, reason) in &reasons {
        let root = groups.find(contributor);
        let conflict = conflicts.entry(root).or_insert_with(|| IdentityConflict {
            contributors: BTreeSet::new(),
            handles: BTreeSet::new(),
            addresses: BTreeSet::new(),
            contributions: BTreeSet::new(),
            reason: (*reason).to_string(),
        });
        conflict.contributors.insert((*contributor).clone());
        for view in views.get(contributor).into_iter().flatten() {
            conflict.handles.insert(view.handle.clone());
            conflict.addresses.extend(view.claims.iter().cloned());
        }
        for candidate in candidates {
            if candidate.view.contributor_id == **contributor {
                conflict.contributions.insert(candidate.contribution_id.clone());
            }
        }
    }
    conflicts.into_values().collect()
}

#[derive(Default)]
struct UnionFind<'a> {
    parent: BTreeMap<&'a ContributorId, &'a ContributorId>,
}

impl<'a> UnionFind<'a> {
    fn add(&mut self, id: &'a ContributorId) {
        self.parent.entry(id).or_insert(id);
    }

    fn find(&mut self, id: &'a ContributorId) -> &'a ContributorId {
        self.add(id);
        let mut root = id;
        while let Some(parent) = self.parent.get(root).copied().filter(|parent| *parent != root) {
            root = parent;
        }
        self.parent.insert(id, root);
        root
    }

    fn union(&mut self, a: &'a ContributorId, b: &'a ContributorId) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            let (keep, merge) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent.insert(merge, keep);
        }
    }
}

fn manifest_hash(
    cycle_id: &CycleId,
    currency_unit: &str,
    allocations: &[Allocation],
    conflicts: &[IdentityConflict],
    unallocated: &[UnallocatedContribution],
) -> Result<String, RewardsError> {
    let material = serde_json::json!({
        "cycle_id": cycle_id,
        "currency_unit": currency_unit,
        "allocations": allocations,
        "conflicts": conflicts,
        "unallocated": unallocated,
    });
    let bytes =
        serde_json::to_vec(&material).map_err(|e| RewardsError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Result of storing a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestWrite {
    Stored(AllocationManifest),
    AlreadyAllocated(AllocationManifest),
}

impl ManifestWrite {
    pub fn manifest(&self) -> &AllocationManifest {
        match self {
            Self::Stored(manifest) | Self::AlreadyAllocated(manifest) => manifest,
        }
    }

    pub fn into_manifest(self) -> AllocationManifest {
        match self {
            Self::Stored(manifest) | Self::AlreadyAllocated(manifest) => manifest,
        }
    }
}

/// Write-once manifest store keyed by cycle.
#[derive(Debug, Default)]
pub struct ManifestStore {
    manifests: DashMap<CycleId, AllocationManifest>,
}

impl ManifestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, cycle_id: &CycleId) -> Option<AllocationManifest> {
        self.manifests.get(cycle_id).map(|entry| entry.value().clone())
    }

    pub fn insert_once(&self, manifest: AllocationManifest) -> ManifestWrite {
        match self.manifests.entry(manifest.cycle_id.clone()) {
            Entry::Occupied(existing) => ManifestWrite::AlreadyAllocated(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(manifest.clone());
                ManifestWrite::Stored(manifest)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRegistry;
    use crate::types::{Contribution, ContributionStatus, CorrelationKey, Handle, Platform};

    fn contribution(key: u64, contributor: Option<Handle>, amount: Option<u64>) -> ResolvedContribution {
        ResolvedContribution {
            contribution: Contribution {
                contribution_id: ContributionId::from(format!("contrib-{key}")),
                cycle_id: CycleId::from("c1"),
                correlation_key: CorrelationKey::issue(key),
                contributor,
                source_refs: BTreeSet::new(),
                description: String::new(),
                reward_type: None,
                url: None,
                created_at: Utc::now(),
                status: ContributionStatus::Locked,
            },
            active_suggestions: Vec::new(),
            resolved_amount: amount,
        }
    }

    fn gh(name: &str) -> Handle {
        Handle::new(Platform::Github, name)
    }

    async fn run(
        registry: &IdentityRegistry,
        contributions: &[ResolvedContribution],
    ) -> Result<AllocationManifest, RewardsError> {
        let handles: Vec<&Handle> = contributions
            .iter()
            .filter_map(|c| c.contribution.contributor.as_ref())
            .collect();
        let snapshot = IdentitySnapshot::capture(registry, handles).await?;
        let cycle_id = CycleId::from("c1");
        let resolved = BTreeSet::new();
        reconcile(ReconcileInput {
            cycle_id: &cycle_id,
            currency_unit: "ASA",
            contributions,
            identities: &snapshot,
            similarity_threshold: 0.6,
            resolved: &resolved,
            created_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn sums_per_address_and_reports_skips() {
        let registry = IdentityRegistry::new();
        registry.claim_for_handle(&gh("alice"), "ADDR_A").unwrap();
        let contributions = vec![
            contribution(1, Some(gh("alice")), Some(50)),
            contribution(2, Some(gh("alice")), Some(25)),
            contribution(3, None, Some(10)),
            contribution(4, Some(gh("nobody")), Some(10)),
            contribution(5, Some(gh("alice")), None),
        ];

        let manifest = run(&registry, &contributions).await.unwrap();
        assert_eq!(manifest.allocations.len(), 1);
        assert_eq!(manifest.allocation_for("ADDR_A").unwrap().total_amount, 75);
        assert_eq!(manifest.total_amount, 75);
        let reasons: Vec<_> = manifest.unallocated.iter().map(|u| u.reason.clone()).collect();
        assert_eq!(
            reasons,
            vec![
                UnallocatedReason::MissingContributor,
                UnallocatedReason::UnresolvedAddress,
                UnallocatedReason::NoSuggestions,
            ]
        );
    }

    #[tokio::test]
    async fn manifest_hash_is_deterministic() {
        let registry = IdentityRegistry::new();
        registry.claim_for_handle(&gh("alice"), "ADDR_A").unwrap();
        let contributions = vec![contribution(1, Some(gh("alice")), Some(50))];
        let first = run(&registry, &contributions).await.unwrap();
        let second = run(&registry, &contributions).await.unwrap();
        assert_eq!(first.manifest_hash, second.manifest_hash);
    }

    #[tokio::test]
    async fn similar_unlinked_handles_with_different_addresses_conflict() {
        let registry = IdentityRegistry::new();
        registry.claim_for_handle(&gh("satoshi"), "ADDR_1").unwrap();
        registry
            .claim_for_handle(&Handle::new(Platform::Discord, "satoshi"), "ADDR_2")
            .unwrap();
        registry.claim_for_handle(&gh("mallory"), "ADDR_M").unwrap();

        let contributions = vec![
            contribution(1, Some(gh("satoshi")), Some(10)),
            contribution(2, Some(Handle::new(Platform::Discord, "satoshi")), Some(20)),
            contribution(3, Some(gh("mallory")), Some(30)),
        ];
        let manifest = run(&registry, &contributions).await.unwrap();
        assert_eq!(manifest.allocations.len(), 1);
        assert_eq!(manifest.conflicts.len(), 1);
        let conflict = &manifest.conflicts[0];
        assert_eq!(conflict.contributors.len(), 2);
        assert_eq!(conflict.addresses.len(), 2);
        assert_eq!(conflict.contributions.len(), 2);
    }

    #[tokio::test]
    async fn all_conflicted_fails_and_empty_cycle_is_reported() {
        let registry = IdentityRegistry::new();
        registry.claim_for_handle(&gh("alice"), "A1").unwrap();
        registry.claim_for_handle(&gh("alice"), "A2").unwrap();
        let err = run(&registry, &[contribution(1, Some(gh("alice")), Some(5))])
            .await
            .unwrap_err();
        assert!(matches!(err, RewardsError::IdentityConflict(ref c) if c.len() == 1));

        let err = run(&registry, &[contribution(1, Some(gh("alice")), None)])
            .await
            .unwrap_err();
        assert!(matches!(err, RewardsError::EmptyCycle(_)));
    }

    #[test]
    fn manifest_store_is_write_once() {
        let store = ManifestStore::new();
        let manifest = AllocationManifest {
            cycle_id: CycleId::from("c1"),
            currency_unit: "ASA".to_string(),
            allocations: Vec::new(),
            conflicts: Vec::new(),
            unallocated: Vec::new(),
            total_amount: 0,
            manifest_hash: "h1".to_string(),
            created_at: Utc::now(),
        };
        assert!(matches!(store.insert_once(manifest.clone()), ManifestWrite::Stored(_)));

        let mut other = manifest.clone();
        other.manifest_hash = "h2".to_string();
        let write = store.insert_once(other);
        assert!(matches!(write, ManifestWrite::AlreadyAllocated(_)));
        assert_eq!(write.manifest().manifest_hash, "h1");
    }
}
