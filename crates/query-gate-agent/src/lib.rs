#![forbid(unsafe_code)]

use std::rc::Rc;

use anyhow::{anyhow, Result};
use query_gate_db::{LoggedConnection, ResultSet};
use query_gate_domain::{AuditSink, ToolInvocation, DATABASE_QUERY_TOOL};
use query_gate_policy::ToolCallGuard;
use serde_json::{json, Value};

mod http;
mod mock;

pub use http::{HttpJsonAgent, SseChunks};
pub use mock::MockAgent;

pub const TOOL_DENIED_MESSAGE: &str =
    "Tool call denied: only read-only SELECT queries may be executed.";

const BASE_INSTRUCTIONS: &str = "You are a data analyst. Analyze database queries and provide insights. You can only execute SELECT queries for security reasons.";

/// Lazily produced answer fragments. Each pull may block on the upstream model.
pub type ChunkStream<'a> = Box<dyn Iterator<Item = Result<String>> + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRequest {
    pub question: String,
    pub model: String,
    pub instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub answer: String,
    pub tool_calls: usize,
}

/// A data-analyst agent: answers a question, querying the database only
/// through the [`ToolRuntime`] it is handed.
pub trait AgentBackend {
    fn backend_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn respond(&self, runtime: &ToolRuntime<'_>, request: &AgentRequest) -> Result<AgentReply>;

    /// Tool calls complete before this returns; the stream borrows only the
    /// backend.
    #[allow(clippy::missing_errors_doc)]
    fn stream<'a>(
        &'a self,
        runtime: &ToolRuntime<'_>,
        request: &AgentRequest,
    ) -> Result<ChunkStream<'a>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Denied { message: String },
    Rows(ResultSet),
}

impl ToolOutcome {
    /// Tool result content handed back to a model, rows capped at `max_rows`.
    #[must_use]
    pub fn to_tool_content(&self, max_rows: usize) -> String {
        match self {
            Self::Denied { message } => json!({ "error": message }).to_string(),
            Self::Rows(result) => json!({
                "row_count": result.len(),
                "rows": result.to_objects(max_rows),
                "truncated": result.len() > max_rows,
            })
            .to_string(),
        }
    }
}

/// Executes agent tool calls: the guard decides first, then allowed SQL runs
/// through the statement interceptor.
pub struct ToolRuntime<'a> {
    conn: &'a LoggedConnection,
    guard: ToolCallGuard,
}

impl<'a> ToolRuntime<'a> {
    #[must_use]
    pub fn new(conn: &'a LoggedConnection, audit: Rc<dyn AuditSink>) -> Self {
        Self {
            conn,
            guard: ToolCallGuard::new(audit),
        }
    }

    #[must_use]
    pub fn connection(&self) -> &LoggedConnection {
        self.conn
    }

    /// # Errors
    /// Returns an error for an unknown tool, an empty query, a write refused
    /// by the interceptor, or a driver failure. A guard denial is not an
    /// error; it is returned as [`ToolOutcome::Denied`].
    pub fn execute(&self, invocation: &ToolInvocation) -> Result<ToolOutcome> {
        if invocation.tool_name != DATABASE_QUERY_TOOL {
            return Err(anyhow!("unknown tool requested: {}", invocation.tool_name));
        }

        if !self.guard.before_tool_execution(invocation).is_allowed() {
            return Ok(ToolOutcome::Denied {
                message: TOOL_DENIED_MESSAGE.to_string(),
            });
        }

        let sql = invocation.query_argument();
        if sql.trim().is_empty() {
            return Err(anyhow!(
                "{DATABASE_QUERY_TOOL} requires a non-empty 'query' argument"
            ));
        }
        let result = self.conn.query(&sql)?;
        tracing::debug!(
            call_id = %invocation.call_id,
            rows = result.len(),
            "tool call executed"
        );
        Ok(ToolOutcome::Rows(result))
    }
}

/// JSON schema of the single tool offered to models.
#[must_use]
pub fn database_query_tool_definition() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": DATABASE_QUERY_TOOL,
            "description": "Run one read-only SQL SELECT statement against the application database and return its rows.",
            "parameters": {
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single SQLite SELECT statement."
                    }
                },
                "required": ["query"]
            }
        }
    })
}

/// System instructions carrying the schema boundary the agent may query.
#[must_use]
pub fn data_analyst_instructions(schema_description: &str) -> String {
    if schema_description.trim().is_empty() {
        return BASE_INSTRUCTIONS.to_string();
    }
    format!(
        "{BASE_INSTRUCTIONS}\nOnly these tables and columns are available:\n{schema_description}"
    )
}
