#![forbid(unsafe_code)]

use std::borrow::Cow;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

mod audit;

pub use audit::{AuditEntry, AuditSeverity, AuditSink, MemoryAuditSink, TracingAuditSink};

pub type DateTimeUtc = OffsetDateTime;

/// Name of the single tool the agents are allowed to call.
pub const DATABASE_QUERY_TOOL: &str = "database_query";

pub const WRITE_BLOCKED_MESSAGE: &str = "Write operation detected and blocked";
pub const CHAT_DISABLED_MESSAGE: &str = "AI chat is not enabled";
pub const BREACH_MESSAGE: &str = "AI write operations forbidden";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateError {
    #[error("security error: {0}")]
    Security(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("security breach: {message}")]
    Breach { sql: String, message: String },
    #[error("validation error: {0}")]
    Validation(String),
}

impl GateError {
    #[must_use]
    pub fn write_blocked() -> Self {
        Self::Security(WRITE_BLOCKED_MESSAGE.to_string())
    }

    #[must_use]
    pub fn chat_disabled() -> Self {
        Self::Configuration(CHAT_DISABLED_MESSAGE.to_string())
    }

    #[must_use]
    pub fn breach(sql: &str) -> Self {
        Self::Breach {
            sql: sql.to_string(),
            message: BREACH_MESSAGE.to_string(),
        }
    }

    #[must_use]
    pub fn is_breach(&self) -> bool {
        matches!(self, Self::Breach { .. })
    }
}

/// Find a [`GateError`] anywhere in an `anyhow` chain.
#[must_use]
pub fn find_gate_error(err: &anyhow::Error) -> Option<&GateError> {
    err.chain().find_map(|cause| cause.downcast_ref::<GateError>())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub Ulid);

impl ThreadId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ThreadId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let ulid = Ulid::from_string(value).map_err(|err| anyhow!("invalid thread_id: {err}"))?;
        Ok(Self(ulid))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MessageId(pub Ulid);

impl MessageId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
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
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatThread {
    pub thread_id: ThreadId,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTimeUtc,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChatMessage {
    pub thread_id: ThreadId,
    pub role: MessageRole,
    pub content: String,
    pub query_generated: Option<String>,
    pub metadata: Value,
}

impl NewChatMessage {
    #[must_use]
    pub fn user(thread_id: ThreadId, content: &str) -> Self {
        Self {
            thread_id,
            role: MessageRole::User,
            content: content.to_string(),
            query_generated: None,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }
}

/// A persisted chat message. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub role: MessageRole,
    pub content: String,
    pub query_generated: Option<String>,
    pub metadata: Value,
    pub created_at: DateTimeUtc,
}

impl ChatMessage {
    #[must_use]
    pub fn metadata_flag(&self, key: &str) -> bool {
        self.metadata.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// One statement the interceptor let through, in submission order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatementRecord {
    pub sequence: u64,
    pub sql: String,
    pub sql_hash: String,
    pub recorded_at: DateTimeUtc,
}

/// A statement observed after the driver executed it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub bindings: Vec<Value>,
    pub elapsed: Duration,
}

/// Hook fired by the database driver for every executed statement.
pub trait StatementObserver {
    fn observer_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn observe(&self, statement: &ExecutedStatement) -> std::result::Result<(), GateError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Read,
    Write,
}

impl Verdict {
    #[must_use]
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolDecision {
    Allow,
    Deny,
}

impl ToolDecision {
    #[must_use]
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// One agent-proposed tool call, consumed by the guard and then dropped.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub tool_name: String,
    pub call_id: String,
    pub arguments: Value,
}

impl ToolInvocation {
    #[must_use]
    pub fn new(tool_name: &str, call_id: &str, arguments: Value) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            call_id: call_id.to_string(),
            arguments,
        }
    }

    /// Build an invocation from the raw JSON argument string a model returned.
    /// Unparseable arguments become `null`, which carries no `query`.
    #[must_use]
    pub fn from_raw_arguments(tool_name: &str, call_id: &str, raw_arguments: &str) -> Self {
        let arguments = serde_json::from_str(raw_arguments).unwrap_or(Value::Null);
        Self::new(tool_name, call_id, arguments)
    }

    /// The SQL text to inspect. A missing or null `query` reads as empty;
    /// non-string values are inspected as their JSON text.
    #[must_use]
    pub fn query_argument(&self) -> Cow<'_, str> {
        match self.arguments.get("query") {
            None | Some(Value::Null) => Cow::Borrowed(""),
            Some(Value::String(sql)) => Cow::Borrowed(sql.as_str()),
            Some(other) => Cow::Owned(other.to_string()),
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn hash_sql(sql: &str) -> String {
    hash_bytes(sql.as_bytes())
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!(GateError::Validation(format!(
            "{field_name} MUST be non-empty"
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{find_gate_error, GateError, MessageRole, ThreadId, ToolInvocation};
    use anyhow::Context;
    use serde_json::json;

    #[test]
    fn missing_query_argument_reads_as_empty() {
        let invocation = ToolInvocation::new("database_query", "call_1", json!({"limit": 5}));
        assert_eq!(invocation.query_argument(), "");

        let invocation = ToolInvocation::from_raw_arguments("database_query", "call_2", "{not json");
        assert_eq!(invocation.query_argument(), "");
    }

    #[test]
    fn non_string_query_is_inspected_as_json_text() {
        let invocation = ToolInvocation::new(
            "database_query",
            "call_3",
            json!({"query": ["DROP TABLE tasks"]}),
        );
        assert!(invocation.query_argument().contains("DROP TABLE tasks"));
    }

    #[test]
    fn gate_error_is_found_through_context_layers() {
        let result: anyhow::Result<()> = Err(anyhow::Error::new(GateError::write_blocked()))
            .context("tool call failed")
            .context("agent turn failed");
        let err = result.err().unwrap_or_else(|| unreachable!());
        let found = find_gate_error(&err);
        assert_eq!(found, Some(&GateError::write_blocked()));
        assert!(!GateError::write_blocked().is_breach());
        assert!(GateError::breach("INSERT INTO x VALUES (1)").is_breach());
    }

    #[test]
    fn ids_and_roles_round_trip_through_text() {
        let thread_id = ThreadId::new();
        let parsed: ThreadId = thread_id
            .to_string()
            .parse()
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed, thread_id);
        assert_eq!(MessageRole::parse("assistant"), Some(MessageRole::Assistant));
        assert_eq!(MessageRole::parse("system"), None);
    }
}
