#![forbid(unsafe_code)]

//! Shared model for the context-and-response caching subsystem.
//!
//! The persistent stores (`context-cache-store-sqlite`) and the in-process
//! response cache (`context-cache-response`) both build on the types here:
//! identifiers, records, the canonical content hash, the environment
//! [`fingerprint`] engine and the [`Settings`] that bound every store.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub mod fingerprint;
pub mod settings;

pub use fingerprint::{fingerprint, similarity, Fingerprint};
pub use settings::{
    ContextLimits, ConversationLimits, PromptNormalization, ResponseCacheSettings, Settings,
};

/// Section header that prompt templates look for when conversation history is
/// spliced into a model prompt.
pub const CONVERSATION_HISTORY_HEADER: &str = "=== CONVERSATION HISTORY ===";

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
pub const DEFAULT_TAG: &str = "general";

const CONTEXT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CacheError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ContextId(pub i64);

impl Display for ContextId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConversationId(pub Ulid);

impl ConversationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for ConversationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConversationId {
    type Err = CacheError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(raw)
            .map(Self)
            .map_err(|err| CacheError::Validation(format!("invalid conversation id {raw}: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Assistant => "Assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextRecord {
    pub id: ContextId,
    pub owner: String,
    pub tag: String,
    pub content: Value,
    pub content_hash: String,
    pub metadata: Value,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "timestamp")]
    pub last_seen_at: OffsetDateTime,
}

/// A search hit from the context store. `score` is in `[0, 1]`, higher is
/// more relevant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredContext {
    pub id: ContextId,
    pub content: Value,
    pub tag: String,
    pub metadata: Value,
    pub score: f64,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentContext {
    pub tag: String,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
    pub is_summarized: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextSummary {
    pub total: usize,
    pub by_tag: BTreeMap<String, usize>,
    pub recent: Vec<RecentContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextStats {
    pub total_contexts: usize,
    pub by_tag: BTreeMap<String, usize>,
    pub database_size_bytes: u64,
    pub limits: ContextLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub owner: String,
    pub title: String,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
    #[serde(with = "timestamp")]
    pub last_updated_at: OffsetDateTime,
    pub message_count: usize,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub id: i64,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub metadata: Option<Value>,
    pub tag: String,
    #[serde(with = "timestamp")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationStats {
    pub active_conversations: usize,
    pub inactive_conversations: usize,
    pub total_messages: usize,
    pub unique_owners: usize,
    pub database_size_bytes: u64,
    pub limits: ConversationLimits,
}

/// Lenient context store contract used on the request path. Failures are
/// logged by the implementation and surface as the empty outcome.
pub trait ContextStore: Send + Sync {
    fn store(&self, owner: &str, content: &Value, tag: &str) -> Option<ContextId>;

    fn retrieve(&self, owner: &str, query: &str, limit: usize) -> Vec<ScoredContext>;

    fn summary(&self, owner: &str) -> ContextSummary;

    fn clear(&self, owner: &str) -> bool;

    fn stats(&self) -> Option<ContextStats>;

    /// Deletes rows past the configured age and returns how many went away.
    fn sweep_expired(&self) -> usize;
}

/// Lenient conversation store contract used on the request path.
pub trait ConversationStore: Send + Sync {
    fn start(&self, owner: &str, title: Option<&str>) -> Option<ConversationId>;

    fn add_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
        metadata: Option<&Value>,
        tag: Option<&str>,
    ) -> bool;

    /// Most recent `limit` messages, oldest first.
    fn history(&self, conversation_id: ConversationId, limit: usize) -> Vec<MessageRecord>;

    fn active_conversation(&self, owner: &str) -> Option<ConversationId>;

    fn clear(&self, conversation_id: ConversationId) -> bool;

    fn delete(&self, conversation_id: ConversationId) -> bool;

    fn format_as_context(&self, conversation_id: ConversationId, limit: usize) -> String;

    fn sweep_expired(&self) -> usize;
}

/// Returns a copy of `value` with object keys sorted at every nesting level.
///
/// Arrays keep their order; only object key order is normalized.
#[must_use]
pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries = map.iter().collect::<Vec<_>>();
            entries.sort_by(|lhs, rhs| lhs.0.cmp(rhs.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, item) in entries {
                sorted.insert(key.clone(), canonicalize_json(item));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

/// Serializes `value` in canonical (sorted-key, compact) form.
///
/// # Errors
/// Returns [`CacheError::Serialization`] if JSON serialization fails.
pub fn canonical_json_string(value: &Value) -> Result<String, CacheError> {
    serde_json::to_string(&canonicalize_json(value))
        .map_err(|err| CacheError::Serialization(format!("failed to serialize payload: {err}")))
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Identity hash of a payload: SHA-256 over its canonical serialization.
///
/// # Errors
/// Returns [`CacheError::Serialization`] if JSON serialization fails.
pub fn content_hash(value: &Value) -> Result<String, CacheError> {
    let canonical = canonical_json_string(value)?;
    Ok(hash_bytes(canonical.as_bytes()))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`CacheError::Validation`] when the value is empty or whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), CacheError> {
    if value.trim().is_empty() {
        return Err(CacheError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Renders messages as the conversation block spliced into model prompts.
///
/// Returns an empty string when there are no messages.
#[must_use]
pub fn render_conversation_context(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return String::new();
    }

    let mut rendered = format!("\n\n{CONVERSATION_HISTORY_HEADER}\n");
    for (index, message) in messages.iter().enumerate() {
        rendered.push_str(&format!(
            "\n{} (Message {}):\n{}\n",
            message.role.label(),
            index + 1,
            message.content
        ));

        if let Some(metadata) = &message.metadata {
            let pretty = serde_json::to_string_pretty(metadata).unwrap_or_default();
            let excerpt = pretty.chars().take(CONTEXT_EXCERPT_CHARS).collect::<String>();
            rendered.push_str(&format!("Context: {excerpt}...\n"));
        }
    }

    rendered
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as fixed-width RFC3339 UTC with nanosecond precision.
///
/// Fixed width keeps lexicographic order equal to chronological order, which
/// the stores rely on for `ORDER BY` and cutoff comparisons on text columns.
///
/// # Errors
/// Returns [`CacheError::Serialization`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, CacheError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:9]Z"
        ))
        .map_err(|err| CacheError::Serialization(format!("failed to format timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`CacheError::Validation`] when parsing fails or the timestamp is
/// not UTC.
pub fn parse_timestamp(value: &str) -> Result<OffsetDateTime, CacheError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| CacheError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(CacheError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn hours_between(earlier: OffsetDateTime, later: OffsetDateTime) -> f64 {
    if later <= earlier {
        return 0.0;
    }
    (later - earlier).as_seconds_f64() / Duration::HOUR.as_seconds_f64()
}

/// Serde adapter for timestamps in the fixed-width store format.
pub mod timestamp {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    #[allow(clippy::missing_errors_doc)]
    pub fn serialize<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let formatted = super::format_timestamp(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    #[allow(clippy::missing_errors_doc)]
    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
