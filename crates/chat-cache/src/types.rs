//! Core types for the chat cache

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// A category of cached data, each with its own entry store and mirror document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Message,
    Event,
    Contact,
    Chat,
    GroupMetadata,
}

impl Domain {
    pub const ALL: [Domain; 5] = [
        Domain::Message,
        Domain::Event,
        Domain::Contact,
        Domain::Chat,
        Domain::GroupMetadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Message => "message",
            Domain::Event => "event",
            Domain::Contact => "contact",
            Domain::Chat => "chat",
            Domain::GroupMetadata => "group_metadata",
        }
    }

    /// Name of the mirror document for this domain
    pub fn document_name(&self) -> &'static str {
        match self {
            Domain::Message => "messages.json",
            Domain::Event => "events.json",
            Domain::Contact => "contacts.json",
            Domain::Chat => "chats.json",
            Domain::GroupMetadata => "group_metadata.json",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let normalized = normalized.trim_end_matches('s');
        Domain::ALL
            .into_iter()
            .find(|d| d.as_str() == normalized || (normalized == "group" && *d == Domain::GroupMetadata))
            .ok_or_else(|| {
                let valid: Vec<&str> = Domain::ALL.iter().map(|d| d.as_str()).collect();
                format!("unknown domain '{}'; valid names: {}", s, valid.join(", "))
            })
    }
}

/// A chat message as delivered by the protocol client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub id: String,
    pub chat_id: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A platform event (presence, reaction, group change, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub push_name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Group info returned by the protocol client, plus cache bookkeeping flags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMetadata {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(rename = "_fetchedFromClient", default)]
    pub fetched_from_client: bool,
    #[serde(rename = "_participantCount", default)]
    pub participant_count: usize,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GroupMetadata {
    pub fn with_subject(subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            ..Default::default()
        }
    }
}

/// Domain payload carried by a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Message(MessageEnvelope),
    Event(EventPayload),
    Contact(ContactRecord),
    Chat(ChatRecord),
    GroupMetadata(GroupMetadata),
}

impl Payload {
    pub fn domain(&self) -> Domain {
        match self {
            Payload::Message(_) => Domain::Message,
            Payload::Event(_) => Domain::Event,
            Payload::Contact(_) => Domain::Contact,
            Payload::Chat(_) => Domain::Chat,
            Payload::GroupMetadata(_) => Domain::GroupMetadata,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Payload::Message(m) => &m.id,
            Payload::Event(e) => &e.id,
            Payload::Contact(c) => &c.id,
            Payload::Chat(c) => &c.id,
            Payload::GroupMetadata(g) => &g.id,
        }
    }

    /// Recency scope: the conversation for messages, the event type for events
    pub fn scope(&self) -> Option<&str> {
        match self {
            Payload::Message(m) => Some(m.chat_id.as_str()),
            Payload::Event(e) => Some(e.event_type.as_str()),
            _ => None,
        }
    }

    /// Timestamp reported by the source, if it carries one
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Payload::Message(m) => m.timestamp,
            Payload::Event(e) => e.occurred_at,
            Payload::Chat(c) => c.last_message_at,
            _ => None,
        }
    }

    pub fn as_group_metadata(&self) -> Option<&GroupMetadata> {
        match self {
            Payload::GroupMetadata(g) => Some(g),
            _ => None,
        }
    }
}

/// Whole milliseconds, rounding sub-millisecond remainders up
fn ttl_millis(ttl: std::time::Duration) -> u64 {
    let ms = ttl.as_nanos().div_ceil(1_000_000);
    u64::try_from(ms).unwrap_or(u64::MAX)
}

/// A cached value with its bookkeeping timestamps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Payload,
    pub cached_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl CacheEntry {
    pub fn new(key: String, value: Payload, now: DateTime<Utc>, ttl: Option<std::time::Duration>) -> Self {
        Self {
            key,
            value,
            cached_at: now,
            last_accessed_at: now,
            ttl_ms: ttl.map(ttl_millis),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ms = self.ttl_ms?;
        let ttl = Duration::try_milliseconds(ms.min(i64::MAX as u64) as i64)?;
        Some(
            self.cached_at
                .checked_add_signed(ttl)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Expired once `now >= cachedAt + ttl`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| now >= at)
    }

    /// Time used for range filters: the source timestamp when present
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.value.timestamp().unwrap_or(self.cached_at)
    }
}

/// Filters for `ChatCache::search`; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct SearchCriteria {
    pub scope: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl SearchCriteria {
    pub fn scope(mut self, scope: &str) -> Self {
        self.scope = Some(scope.to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Scope filters only apply to domains that have scopes
    pub fn matches(&self, entry: &CacheEntry) -> bool {
        if let (Some(wanted), Some(scope)) = (self.scope.as_deref(), entry.value.scope()) {
            if wanted != scope {
                return false;
            }
        }
        let time = entry.effective_time();
        if self.since.is_some_and(|since| time < since) {
            return false;
        }
        if self.until.is_some_and(|until| time > until) {
            return false;
        }
        true
    }
}

/// Where a group metadata lookup was answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchSource {
    /// A fresh cached copy; the client was not called
    Cache,
    /// The client was called and the result written through
    Client,
    /// The client failed and a stale cached copy was returned
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    pub metadata: GroupMetadata,
    pub source: FetchSource,
    pub cached_at: DateTime<Utc>,
}

impl FetchOutcome {
    pub fn is_stale(&self) -> bool {
        self.source == FetchSource::Stale
    }
}
