//! Provider payload normalization.
//!
//! Every provider shape is mapped onto [`RawEvent`] by a pure function. The content hash
//! covers only semantic fields (author, target, contributor, amount, body) so envelope
//! metadata such as delivery ids or retry counters never defeats deduplication.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{EngineConfig, RewardCatalog};
use crate::error::RewardsError;
use crate::types::{
    CorrelationKey, EventId, EventKind, EventPayload, Handle, Platform, ProviderKind, RawEvent,
    SuggestedAmount,
};

/// Pre-shaped inbound event from a collaborator that already parsed its provider format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRawEvent {
    pub provider: ProviderKind,
    pub external_id: String,
    pub author_identity: String,
    pub kind: EventKind,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

/// Fields every provider mapping produces before hashing.
struct Draft {
    external_id: String,
    author: Handle,
    kind: EventKind,
    correlation_key: CorrelationKey,
    contributor: Option<Handle>,
    amount: Option<u64>,
    reward_type: Option<String>,
    description: String,
    body: String,
    url: Option<String>,
    source_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EventNormalizer {
    currency_unit: String,
    catalog: RewardCatalog,
    excluded: Vec<String>,
}

impl EventNormalizer {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            currency_unit: config.currency_unit.clone(),
            catalog: config.reward_catalog.clone(),
            excluded: config
                .excluded_contributors
                .iter()
                .map(|handle| handle.trim_start_matches('@').to_lowercase())
                .collect(),
        }
    }

    pub fn currency_unit(&self) -> &str {
        &self.currency_unit
    }

    /// Map a provider-specific payload to a canonical event.
    pub fn normalize(
        &self,
        provider: ProviderKind,
        raw: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<RawEvent, RewardsError> {
        if !raw.is_object() {
            return Err(RewardsError::malformed(
                provider.name(),
                "payload must be a JSON object",
            ));
        }
        let draft = match provider {
            ProviderKind::Github => self.github(raw)?,
            ProviderKind::Gitlab => self.gitlab(raw)?,
            ProviderKind::Bitbucket => self.bitbucket(raw)?,
            ProviderKind::DiscordBot => self.discord_bot(raw)?,
            ProviderKind::DiscordTracker
            | ProviderKind::RedditTracker
            | ProviderKind::TelegramTracker
            | ProviderKind::TwitterTracker
            | ProviderKind::TwitterApiIoTracker => self.tracker(provider, raw)?,
        };
        self.finish(provider, draft, raw.clone(), received_at)
    }

    /// Normalize a collaborator submission whose kind and author are already known.
    pub fn normalize_submission(&self, submission: &SubmitRawEvent) -> Result<RawEvent, RewardsError> {
        let provider = submission.provider;
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        let payload = &submission.payload;
        if !payload.is_object() {
            return Err(malformed("payload must be a JSON object"));
        }
        if submission.external_id.trim().is_empty() {
            return Err(malformed("external_id is required"));
        }
        if submission.author_identity.trim().is_empty() {
            return Err(malformed("author_identity is required"));
        }

        let platform = provider.platform();
        let author = Handle::new(platform, submission.author_identity.as_str());
        let target = str_at(payload, &["target"]).ok_or_else(|| malformed("target is required"))?;
        let correlation_key =
            CorrelationKey::from_target(target).ok_or_else(|| malformed("target is empty"))?;
        let (amount, reward_type) = self.amount_fields(provider, payload)?;
        if submission.kind == EventKind::Suggestion && amount.is_none() {
            return Err(malformed("suggestion requires an amount or reward type"));
        }
        let contributor = self.credited(
            platform,
            str_at(payload, &["contributor"]),
            &author,
            submission.kind,
        );

        let draft = Draft {
            external_id: submission.external_id.trim().to_string(),
            author,
            kind: submission.kind,
            correlation_key,
            contributor,
            amount,
            reward_type: reward_type.clone(),
            description: str_at(payload, &["description"])
                .map(str::to_string)
                .or_else(|| reward_type.map(|code| self.catalog.label_for(&code)))
                .unwrap_or_default(),
            body: str_at(payload, &["body"]).unwrap_or_default().to_string(),
            url: str_at(payload, &["url"]).map(str::to_string),
            source_created_at: timestamp_at(payload, &["created_at"]),
        };
        self.finish(provider, draft, payload.clone(), submission.received_at)
    }

    fn finish(
        &self,
        provider: ProviderKind,
        draft: Draft,
        raw: Value,
        received_at: DateTime<Utc>,
    ) -> Result<RawEvent, RewardsError> {
        let amount = draft.amount.map(|amount| SuggestedAmount {
            amount,
            currency_unit: self.currency_unit.clone(),
        });
        let content_hash = content_hash(
            provider,
            draft.kind,
            &draft.author,
            &draft.correlation_key,
            draft.contributor.as_ref(),
            amount.as_ref(),
            &draft.description,
            &draft.body,
        )?;

        Ok(RawEvent {
            event_id: EventId::new(),
            provider,
            external_id: draft.external_id,
            author_identity: draft.author,
            kind: draft.kind,
            payload: EventPayload {
                correlation_key: draft.correlation_key,
                contributor: draft.contributor,
                amount,
                reward_type: draft.reward_type,
                description: draft.description,
                body: draft.body,
                url: draft.url,
                source_created_at: draft.source_created_at,
                raw,
            },
            received_at,
            content_hash,
        })
    }

    fn github(&self, raw: &Value) -> Result<Draft, RewardsError> {
        let provider = ProviderKind::Github;
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        let action = str_at(raw, &["action"]).ok_or_else(|| malformed("missing action"))?;
        let number = u64_at(raw, &["issue", "number"]).ok_or_else(|| malformed("missing issue.number"))?;
        let sender = str_at(raw, &["sender", "login"])
            .or_else(|| str_at(raw, &["issue", "user", "login"]))
            .ok_or_else(|| malformed("missing sender.login"))?;
        let opener = str_at(raw, &["issue", "user", "login"]).unwrap_or(sender);

        let (kind, credited) = match action {
            "closed" => (EventKind::Contribution, sender),
            "opened" | "reopened" | "labeled" | "assigned" => (EventKind::Contribution, opener),
            "edited" => (EventKind::Correction, opener),
            other => return Err(malformed(&format!("unsupported issue action '{other}'"))),
        };

        let platform = provider.platform();
        Ok(Draft {
            external_id: number.to_string(),
            author: Handle::new(platform, sender),
            kind,
            correlation_key: CorrelationKey::issue(number),
            contributor: Some(Handle::new(platform, credited)),
            amount: None,
            reward_type: None,
            description: str_at(raw, &["issue", "title"]).unwrap_or_default().to_string(),
            body: issue_body(action, str_at(raw, &["issue", "body"])),
            url: str_at(raw, &["issue", "html_url"]).map(str::to_string),
            source_created_at: None,
        })
    }

    fn gitlab(&self, raw: &Value) -> Result<Draft, RewardsError> {
        let provider = ProviderKind::Gitlab;
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        match str_at(raw, &["object_kind"]) {
            Some("issue") => {}
            Some(other) => return Err(malformed(&format!("unsupported object_kind '{other}'"))),
            None => return Err(malformed("missing object_kind")),
        }
        let number = u64_at(raw, &["object_attributes", "iid"])
            .ok_or_else(|| malformed("missing object_attributes.iid"))?;
        let user = str_at(raw, &["user", "username"]).ok_or_else(|| malformed("missing user.username"))?;
        let action = str_at(raw, &["object_attributes", "action"]).unwrap_or("open");
        let kind = match action {
            "open" | "reopen" | "close" => EventKind::Contribution,
            "update" => EventKind::Correction,
            other => return Err(malformed(&format!("unsupported issue action '{other}'"))),
        };

        let platform = provider.platform();
        Ok(Draft {
            external_id: number.to_string(),
            author: Handle::new(platform, user),
            kind,
            correlation_key: CorrelationKey::issue(number),
            contributor: Some(Handle::new(platform, user)),
            amount: None,
            reward_type: None,
            description: str_at(raw, &["object_attributes", "title"])
                .unwrap_or_default()
                .to_string(),
            body: issue_body(action, str_at(raw, &["object_attributes", "description"])),
            url: str_at(raw, &["object_attributes", "url"]).map(str::to_string),
            source_created_at: None,
        })
    }

    fn bitbucket(&self, raw: &Value) -> Result<Draft, RewardsError> {
        let provider = ProviderKind::Bitbucket;
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        let number = u64_at(raw, &["issue", "id"]).ok_or_else(|| malformed("missing issue.id"))?;
        let actor = str_at(raw, &["actor", "nickname"])
            .or_else(|| str_at(raw, &["actor", "username"]))
            .ok_or_else(|| malformed("missing actor.nickname"))?;
        let state = str_at(raw, &["issue", "state"]).unwrap_or("new");
        let kind = if raw.get("changes").is_some() {
            EventKind::Correction
        } else {
            EventKind::Contribution
        };

        let platform = provider.platform();
        Ok(Draft {
            external_id: number.to_string(),
            author: Handle::new(platform, actor),
            kind,
            correlation_key: CorrelationKey::issue(number),
            contributor: Some(Handle::new(platform, actor)),
            amount: None,
            reward_type: None,
            description: str_at(raw, &["issue", "title"]).unwrap_or_default().to_string(),
            body: issue_body(state, str_at(raw, &["issue", "content", "raw"])),
            url: str_at(raw, &["issue", "links", "html", "href"]).map(str::to_string),
            source_created_at: None,
        })
    }

    fn discord_bot(&self, raw: &Value) -> Result<Draft, RewardsError> {
        let provider = ProviderKind::DiscordBot;
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        let command = str_at(raw, &["command"]).ok_or_else(|| malformed("missing command"))?;
        let interaction_id = scalar_at(raw, &["interaction_id"])
            .ok_or_else(|| malformed("missing interaction_id"))?;
        let user = str_at(raw, &["user", "username"]).ok_or_else(|| malformed("missing user.username"))?;
        let target = str_at(raw, &["target"]).ok_or_else(|| malformed("missing target"))?;
        let correlation_key =
            CorrelationKey::from_target(target).ok_or_else(|| malformed("empty target"))?;
        let (amount, reward_type) = self.amount_fields(provider, raw)?;

        let kind = match command {
            "suggest" => {
                if amount.is_none() {
                    return Err(malformed("suggest requires amount or reward_type"));
                }
                EventKind::Suggestion
            }
            "contribute" => EventKind::Contribution,
            "correct" => EventKind::Correction,
            other => return Err(malformed(&format!("unsupported command '{other}'"))),
        };

        let platform = provider.platform();
        let author = Handle::new(platform, user);
        let contributor = self.credited(platform, str_at(raw, &["contributor"]), &author, kind);
        Ok(Draft {
            external_id: interaction_id,
            author,
            kind,
            correlation_key,
            contributor,
            amount,
            reward_type: reward_type.clone(),
            description: reward_type
                .map(|code| self.catalog.label_for(&code))
                .unwrap_or_default(),
            body: str_at(raw, &["comment"]).unwrap_or_default().to_string(),
            url: str_at(raw, &["message_url"]).map(str::to_string),
            source_created_at: timestamp_at(raw, &["created_at"]),
        })
    }

    fn tracker(&self, provider: ProviderKind, raw: &Value) -> Result<Draft, RewardsError> {
        let malformed = |reason: &str| RewardsError::malformed(provider.name(), reason);
        let item_id = scalar_at(raw, &["item_id"]).ok_or_else(|| malformed("missing item_id"))?;
        let suggester = scalar_at(raw, &["suggester"]).ok_or_else(|| malformed("missing suggester"))?;
        let platform = provider.platform();

        let correlation_key = match str_at(raw, &["contribution_url"]) {
            Some(url) if !url.trim().is_empty() => CorrelationKey::post(url),
            _ => match scalar_at(raw, &["parent_id"]) {
                Some(parent) => CorrelationKey::post(&format!("{platform}:{parent}")),
                None => CorrelationKey::post(&format!("{platform}:{item_id}")),
            },
        };

        let (amount, reward_type) = self.amount_fields(provider, raw)?;
        let edited = raw.get("edited").and_then(Value::as_bool).unwrap_or(false);
        let kind = if edited {
            EventKind::Correction
        } else if amount.is_some() {
            EventKind::Suggestion
        } else {
            EventKind::Contribution
        };

        let author = Handle::new(platform, suggester.as_str());
        let named = scalar_at(raw, &["contributor"]);
        let contributor = match named.as_deref() {
            Some(name) if !name.trim().is_empty() && !self.is_excluded(name) => {
                Some(Handle::new(platform, name))
            }
            _ => Some(author.clone()),
        };

        Ok(Draft {
            external_id: item_id,
            author,
            kind,
            correlation_key,
            contributor,
            amount,
            reward_type: reward_type.clone(),
            description: reward_type
                .map(|code| self.catalog.label_for(&code))
                .unwrap_or_default(),
            body: str_at(raw, &["content"]).unwrap_or_default().to_string(),
            url: str_at(raw, &["suggestion_url"]).map(str::to_string),
            source_created_at: timestamp_at(raw, &["timestamp"]),
        })
    }

    /// Explicit `amount` wins; otherwise a reward type code plus level is resolved.
    fn amount_fields(
        &self,
        provider: ProviderKind,
        raw: &Value,
    ) -> Result<(Option<u64>, Option<String>), RewardsError> {
        let malformed = |reason: String| RewardsError::malformed(provider.name(), reason);

        if let Some(unit) = str_at(raw, &["currency_unit"]) {
            if !unit.eq_ignore_ascii_case(&self.currency_unit) {
                return Err(malformed(format!(
                    "currency unit '{}' does not match '{}'",
                    unit, self.currency_unit
                )));
            }
        }

        let reward_type = str_at(raw, &["reward_type"])
            .or_else(|| str_at(raw, &["contribution", "reward_type"]))
            .map(|code| code.trim().to_ascii_uppercase());

        if let Some(value) = raw.get("amount").filter(|value| !value.is_null()) {
            let amount = parse_u64(value)
                .ok_or_else(|| malformed("amount must be a non-negative integer".to_string()))?;
            return Ok((Some(amount), reward_type));
        }

        match reward_type {
            Some(code) => {
                let level = u64_at(raw, &["level"])
                    .or_else(|| u64_at(raw, &["contribution", "level"]))
                    .unwrap_or(1);
                let level = u32::try_from(level)
                    .map_err(|_| malformed(format!("level {level} out of range")))?;
                let amount = self.catalog.amount_for(&code, level).ok_or_else(|| {
                    malformed(format!("unknown reward type '{code}' at level {level}"))
                })?;
                Ok((Some(amount), Some(code)))
            }
            None => Ok((None, None)),
        }
    }

    /// Person credited by an event; suggestions without a named contributor credit nobody.
    fn credited(
        &self,
        platform: Platform,
        named: Option<&str>,
        author: &Handle,
        kind: EventKind,
    ) -> Option<Handle> {
        match named {
            Some(name) if !name.trim().is_empty() && !self.is_excluded(name) => {
                Some(Handle::new(platform, name))
            }
            Some(_) => Some(author.clone()),
            None if kind == EventKind::Suggestion => None,
            None => Some(author.clone()),
        }
    }

    fn is_excluded(&self, name: &str) -> bool {
        let name = name.trim().trim_start_matches('@').to_lowercase();
        self.excluded.iter().any(|excluded| *excluded == name)
    }
}

#[allow(clippy::too_many_arguments)]
fn content_hash(
    provider: ProviderKind,
    kind: EventKind,
    author: &Handle,
    target: &CorrelationKey,
    contributor: Option<&Handle>,
    amount: Option<&SuggestedAmount>,
    description: &str,
    body: &str,
) -> Result<String, RewardsError> {
    let material = serde_json::json!({
        "provider": provider,
        "kind": kind,
        "author": author.to_string().to_lowercase(),
        "target": target,
        "contributor": contributor.map(|handle| handle.to_string().to_lowercase()),
        "amount": amount,
        "description": description.trim(),
        "body": body.trim(),
    });
    let bytes =
        serde_json::to_vec(&material).map_err(|e| RewardsError::Serialization(e.to_string()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// Issue lifecycle state is part of the semantic body so `opened` and `closed` differ.
fn issue_body(state: &str, body: Option<&str>) -> String {
    format!("[{}] {}", state, body.unwrap_or_default().trim())
}

fn value_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter()
        .try_fold(value, |current, key| current.get(*key))
        .filter(|value| !value.is_null())
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    value_at(value, path).and_then(Value::as_str)
}

/// String or number rendered as a string (ids are numeric on some platforms).
fn scalar_at(value: &Value, path: &[&str]) -> Option<String> {
    match value_at(value, path)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn u64_at(value: &Value, path: &[&str]) -> Option<u64> {
    value_at(value, path).and_then(parse_u64)
}

fn parse_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// RFC 3339 string or unix seconds.
fn timestamp_at(value: &Value, path: &[&str]) -> Option<DateTime<Utc>> {
    match value_at(value, path)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|parsed| parsed.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}
