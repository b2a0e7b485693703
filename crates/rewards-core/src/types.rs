use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable identifier of a stored `RawEvent`.
    EventId
);
string_id!(
    /// Stable identifier of a reward cycle.
    CycleId
);
string_id!(
    /// Stable identifier of an aggregated contribution.
    ContributionId
);
string_id!(
    /// Internal contributor identifier. Unlinked handles use `platform:handle`.
    ContributorId
);

/// Social platform that owns a handle namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Github,
    Gitlab,
    Bitbucket,
    Discord,
    Reddit,
    Telegram,
    Twitter,
}

impl Platform {
    pub fn name(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::Discord => "discord",
            Self::Reddit => "reddit",
            Self::Telegram => "telegram",
            Self::Twitter => "twitter",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Broad delivery family of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    IssueWebhook,
    ChatBot,
    MentionTracker,
}

/// Closed set of event sources. New providers are new variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Github,
    Gitlab,
    Bitbucket,
    DiscordBot,
    DiscordTracker,
    RedditTracker,
    TelegramTracker,
    TwitterTracker,
    TwitterApiIoTracker,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        Self::Github,
        Self::Gitlab,
        Self::Bitbucket,
        Self::DiscordBot,
        Self::DiscordTracker,
        Self::RedditTracker,
        Self::TelegramTracker,
        Self::TwitterTracker,
        Self::TwitterApiIoTracker,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
            Self::DiscordBot => "discord_bot",
            Self::DiscordTracker => "discord_tracker",
            Self::RedditTracker => "reddit_tracker",
            Self::TelegramTracker => "telegram_tracker",
            Self::TwitterTracker => "twitter_tracker",
            Self::TwitterApiIoTracker => "twitterapiio_tracker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.name() == value)
    }

    pub fn platform(self) -> Platform {
        match self {
            Self::Github => Platform::Github,
            Self::Gitlab => Platform::Gitlab,
            Self::Bitbucket => Platform::Bitbucket,
            Self::DiscordBot | Self::DiscordTracker => Platform::Discord,
            Self::RedditTracker => Platform::Reddit,
            Self::TelegramTracker => Platform::Telegram,
            Self::TwitterTracker | Self::TwitterApiIoTracker => Platform::Twitter,
        }
    }

    pub fn family(self) -> ProviderFamily {
        match self {
            Self::Github | Self::Gitlab | Self::Bitbucket => ProviderFamily::IssueWebhook,
            Self::DiscordBot => ProviderFamily::ChatBot,
            _ => ProviderFamily::MentionTracker,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Platform-scoped author handle.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub platform: Platform,
    pub name: String,
}

impl Handle {
    pub fn new(platform: Platform, name: impl Into<String>) -> Self {
        Self {
            platform,
            name: name.into().trim().trim_start_matches('@').to_string(),
        }
    }

    /// Contributor id used until an explicit link exists.
    pub fn unlinked_contributor(&self) -> ContributorId {
        ContributorId(format!("{}:{}", self.platform, self.name.to_lowercase()))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.platform)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Contribution,
    Suggestion,
    Correction,
}

impl EventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Contribution => "contribution",
            Self::Suggestion => "suggestion",
            Self::Correction => "correction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "contribution" => Some(Self::Contribution),
            "suggestion" => Some(Self::Suggestion),
            "correction" => Some(Self::Correction),
            _ => None,
        }
    }
}

/// Key that joins all events about one underlying work item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationKey(pub String);

impl CorrelationKey {
    pub fn issue(number: u64) -> Self {
        Self(format!("issue:{number}"))
    }

    pub fn post(reference: &str) -> Self {
        Self(format!("post:{}", reference.trim()))
    }

    /// Parse a free-form target reference (`#7`, `issue #7`, a message URL).
    pub fn from_target(target: &str) -> Option<Self> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return None;
        }
        let lowered = trimmed.to_ascii_lowercase();
        let issue_part = lowered
            .strip_prefix("issue")
            .map(str::trim_start)
            .unwrap_or(&lowered);
        let digits = issue_part.strip_prefix('#').unwrap_or(issue_part).trim();
        if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(number) = digits.parse::<u64>() {
                return Some(Self::issue(number));
            }
        }
        Some(Self::post(trimmed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAmount {
    pub amount: u64,
    pub currency_unit: String,
}

/// Canonical, provider-independent event body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    pub correlation_key: CorrelationKey,
    /// Person credited for the work, when the event names one.
    pub contributor: Option<Handle>,
    pub amount: Option<SuggestedAmount>,
    pub reward_type: Option<String>,
    pub description: String,
    pub body: String,
    pub url: Option<String>,
    /// Source-side creation time, used for suggestion last-write-wins.
    pub source_created_at: Option<DateTime<Utc>>,
    /// Original provider payload retained for audit.
    pub raw: Value,
}

/// Normalized, immutable record of one external signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: EventId,
    pub provider: ProviderKind,
    pub external_id: String,
    pub author_identity: Handle,
    pub kind: EventKind,
    pub payload: EventPayload,
    pub received_at: DateTime<Utc>,
    pub content_hash: String,
}

impl RawEvent {
    pub fn lineage(&self) -> Lineage {
        Lineage {
            provider: self.provider,
            external_id: self.external_id.clone(),
        }
    }

    /// Timestamp used for last-write-wins ordering of suggestions.
    pub fn effective_created_at(&self) -> DateTime<Utc> {
        self.payload.source_created_at.unwrap_or(self.received_at)
    }
}

/// All deliveries sharing one `(provider, external_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lineage {
    pub provider: ProviderKind,
    pub external_id: String,
}

impl fmt::Display for Lineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.external_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    Open,
    Suggested,
    Locked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub contribution_id: ContributionId,
    pub cycle_id: CycleId,
    pub correlation_key: CorrelationKey,
    pub contributor: Option<Handle>,
    pub source_refs: BTreeSet<EventId>,
    pub description: String,
    pub reward_type: Option<String>,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: ContributionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub contribution_id: ContributionId,
    pub suggester_identity: ContributorId,
    pub amount: u64,
    pub currency_unit: String,
    pub created_at: DateTime<Utc>,
    pub source_event: EventId,
    /// Admission order; breaks `created_at` ties.
    pub ingest_seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Active,
    Locking,
    Locked,
    Allocating,
    Allocated,
    ClaimOpen,
    Closed,
}

impl CycleState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Locking => "locking",
            Self::Locked => "locked",
            Self::Allocating => "allocating",
            Self::Allocated => "allocated",
            Self::ClaimOpen => "claim_open",
            Self::Closed => "closed",
        }
    }

    /// States in which the cycle still admits events.
    pub fn is_admitting(self) -> bool {
        matches!(self, Self::Active | Self::Locking)
    }

    /// States between freeze and a dispatched manifest.
    pub fn is_allocating(self) -> bool {
        matches!(self, Self::Locked | Self::Allocating)
    }

    pub fn at_least(self, other: CycleState) -> bool {
        self >= other
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Half-open reward window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl CycleWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    pub cycle_id: CycleId,
    pub window: CycleWindow,
    pub state: CycleState,
    /// Barrier timestamp set on `ACTIVE -> LOCKING`.
    pub lock_at: Option<DateTime<Utc>>,
    pub blocked: Option<String>,
    pub claim_closes_at: Option<DateTime<Utc>>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One per-address total in an allocation manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub cycle_id: CycleId,
    pub contributor_address: String,
    pub total_amount: u64,
    pub contributing_set: BTreeSet<ContributionId>,
}

/// Contributors that plausibly are one person but claim different addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityConflict {
    pub contributors: BTreeSet<ContributorId>,
    pub handles: BTreeSet<Handle>,
    pub addresses: BTreeSet<String>,
    pub contributions: BTreeSet<ContributionId>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnallocatedReason {
    MissingContributor,
    UnresolvedAddress,
    NoSuggestions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnallocatedContribution {
    pub contribution_id: ContributionId,
    pub contributor: Option<ContributorId>,
    pub reason: UnallocatedReason,
}

/// Final, immutable allocation output for one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationManifest {
    pub cycle_id: CycleId,
    pub currency_unit: String,
    pub allocations: Vec<Allocation>,
    pub conflicts: Vec<IdentityConflict>,
    pub unallocated: Vec<UnallocatedContribution>,
    pub total_amount: u64,
    pub manifest_hash: String,
    pub created_at: DateTime<Utc>,
}

impl AllocationManifest {
    pub fn addresses(&self) -> BTreeSet<String> {
        self.allocations
            .iter()
            .map(|allocation| allocation.contributor_address.clone())
            .collect()
    }

    pub fn allocation_for(&self, address: &str) -> Option<&Allocation> {
        self.allocations
            .iter()
            .find(|allocation| allocation.contributor_address == address)
    }

    /// Sub-manifest restricted to `addresses`, used for partial re-dispatch.
    pub fn restricted_to(&self, addresses: &BTreeSet<String>) -> Self {
        let allocations: Vec<Allocation> = self
            .allocations
            .iter()
            .filter(|allocation| addresses.contains(&allocation.contributor_address))
            .cloned()
            .collect();
        let total_amount = allocations.iter().map(|a| a.total_amount).sum();
        Self {
            allocations,
            total_amount,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Pending,
    Dispatched,
    Failed,
    Claimed,
    Reclaimed,
}

impl ClaimStatus {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Claimed | Self::Reclaimed)
    }
}

/// Dispatch and claim outcome for one manifest address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub allocation_ref: String,
    pub cycle_id: CycleId,
    pub address: String,
    pub amount: u64,
    pub tx_ref: Option<String>,
    pub reclaim_tx_ref: Option<String>,
    pub status: ClaimStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub attempted_at: Option<DateTime<Utc>>,
}

/// Caller-facing outcome of `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionReceipt {
    pub accepted: bool,
    pub event_id: Option<EventId>,
    pub cycle_id: Option<CycleId>,
    pub reason: Option<String>,
}

impl AdmissionReceipt {
    pub fn accepted(event_id: EventId, cycle_id: Option<CycleId>) -> Self {
        let reason = if cycle_id.is_none() {
            Some("deferred_to_next_cycle".to_string())
        } else {
            None
        };
        Self {
            accepted: true,
            event_id: Some(event_id),
            cycle_id,
            reason,
        }
    }

    pub fn duplicate(existing: &EventId) -> Self {
        Self {
            accepted: false,
            event_id: Some(existing.clone()),
            cycle_id: None,
            reason: Some(format!("duplicate_of:{existing}")),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            event_id: None,
            cycle_id: None,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_targets_share_a_correlation_key() {
        let expected = CorrelationKey::issue(7);
        assert_eq!(CorrelationKey::from_target("#7"), Some(expected.clone()));
        assert_eq!(CorrelationKey::from_target("issue #7"), Some(expected.clone()));
        assert_eq!(CorrelationKey::from_target("Issue 7"), Some(expected));
    }

    #[test]
    fn non_issue_targets_become_post_keys() {
        let key = CorrelationKey::from_target("https://discord.com/channels/1/2/3").unwrap();
        assert_eq!(key.as_str(), "post:https://discord.com/channels/1/2/3");
        assert!(CorrelationKey::from_target("   ").is_none());
    }

    #[test]
    fn provider_kind_parses_names() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.name()), Some(kind));
        }
        assert_eq!(ProviderKind::TwitterApiIoTracker.platform(), Platform::Twitter);
        assert_eq!(ProviderKind::DiscordBot.family(), ProviderFamily::ChatBot);
    }

    #[test]
    fn unlinked_contributor_ids_are_case_insensitive() {
        let a = Handle::new(Platform::Github, "@Alice");
        let b = Handle::new(Platform::Github, "alice");
        assert_eq!(a.unlinked_contributor(), b.unlinked_contributor());
        assert_eq!(a.unlinked_contributor().as_str(), "github:alice");
    }

    #[test]
    fn cycle_state_ordering_follows_lifecycle() {
        assert!(CycleState::Locked.at_least(CycleState::Locking));
        assert!(!CycleState::Active.at_least(CycleState::Locked));
        assert!(CycleState::Locking.is_admitting());
        assert!(CycleState::Allocating.is_allocating());
    }
}
