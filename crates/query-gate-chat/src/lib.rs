#![forbid(unsafe_code)]

use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use query_gate_agent::{
    data_analyst_instructions, AgentBackend, AgentReply, AgentRequest, ChunkStream, HttpJsonAgent,
    MockAgent, ToolRuntime,
};
use query_gate_config::{AgentBackendKind, Settings};
use query_gate_db::{accessible_schema, describe_schema, write_statement_log, LoggedConnection};
use query_gate_domain::{
    find_gate_error, AuditSink, ChatMessage, GateError, MessageRole, NewChatMessage,
    StatementRecord, ThreadId,
};
use query_gate_store_core::{generate_title_from_first_message, ChatStore};
use serde_json::json;

mod stream;

pub use stream::ChatStream;

/// Lifecycle of one chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    AgentInvoked,
    Succeeded,
    Failed,
}

impl TurnState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::AgentInvoked => "agent_invoked",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Build the backend named by `chat.agent_backend`.
#[must_use]
pub fn select_backend(settings: &Settings) -> Box<dyn AgentBackend> {
    backend_for(settings.chat.agent_backend, settings)
}

#[must_use]
pub fn backend_for(kind: AgentBackendKind, settings: &Settings) -> Box<dyn AgentBackend> {
    match kind {
        AgentBackendKind::HttpJson => Box::new(HttpJsonAgent::new(&settings.http_agent)),
        AgentBackendKind::Mock => Box::new(MockAgent::new(&settings.mock_agent)),
    }
}

/// Runs chat turns: persists the conversation and funnels every agent query
/// through a fresh statement interceptor per turn.
pub struct ChatService<'a> {
    settings: Settings,
    store: &'a dyn ChatStore,
    backend: &'a dyn AgentBackend,
    audit: Rc<dyn AuditSink>,
    query_log: RefCell<Vec<StatementRecord>>,
    last_state: Cell<Option<TurnState>>,
}

impl<'a> ChatService<'a> {
    #[must_use]
    pub fn new(
        settings: &Settings,
        store: &'a dyn ChatStore,
        backend: &'a dyn AgentBackend,
        audit: Rc<dyn AuditSink>,
    ) -> Self {
        Self {
            settings: settings.clone(),
            store,
            backend,
            audit,
            query_log: RefCell::new(Vec::new()),
            last_state: Cell::new(None),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Answer `question` in `thread_id` and persist both sides of the turn.
    ///
    /// Agent failures become an assistant message whose content starts with
    /// `Error:`; only a write breach is returned as an error.
    ///
    /// # Errors
    /// Returns an error when chat is disabled, the store fails, the database
    /// cannot be opened, or the write-breach listener aborted the turn.
    pub fn ask(&self, thread_id: ThreadId, question: &str) -> Result<ChatMessage> {
        self.ensure_enabled()?;
        let span = tracing::info_span!(
            "chat_turn",
            thread_id = %thread_id,
            backend = self.backend.backend_name(),
            streaming = false
        );
        let _entered = span.enter();

        let conn = self.begin_turn(thread_id, question)?;
        self.enter(TurnState::AgentInvoked);
        let outcome = self.invoke(&conn, question);
        self.remember_log(&conn);

        match outcome {
            Ok(reply) => {
                let query_generated = conn.last_query();
                let message = self.store.append_message(&NewChatMessage {
                    thread_id,
                    role: MessageRole::Assistant,
                    content: reply.answer,
                    query_generated: query_generated.clone(),
                    metadata: json!({
                        "provider": self.settings.chat.ai_provider,
                        "model": self.settings.chat.ai_model,
                        "results_count": conn.len(),
                        "query_generated": query_generated,
                    }),
                })?;
                self.enter(TurnState::Succeeded);
                Ok(message)
            }
            Err(err) => {
                self.enter(TurnState::Failed);
                if matches!(find_gate_error(&err), Some(GateError::Breach { .. })) {
                    return Err(err);
                }

                let error_message = format!("{err:#}");
                tracing::error!(
                    thread_id = %thread_id,
                    question = %question,
                    error = %error_message,
                    "chat service error"
                );
                self.store.append_message(&NewChatMessage {
                    thread_id,
                    role: MessageRole::Assistant,
                    content: format!("Error: {error_message}"),
                    query_generated: None,
                    metadata: json!({
                        "provider": self.settings.chat.ai_provider,
                        "model": self.settings.chat.ai_model,
                        "error": true,
                        "error_message": error_message,
                    }),
                })
            }
        }
    }

    /// Stream the answer to `question`. Nothing runs until the first pull.
    ///
    /// # Errors
    /// Returns the configuration error when chat is disabled.
    pub fn ask_stream(&self, thread_id: ThreadId, question: &str) -> Result<ChatStream<'_, 'a>> {
        self.ensure_enabled()?;
        Ok(ChatStream::new(self, thread_id, question))
    }

    /// Statements the interceptor admitted during the last turn.
    #[must_use]
    pub fn query_log(&self) -> Vec<StatementRecord> {
        self.query_log.borrow().clone()
    }

    pub fn clear_query_log(&self) {
        self.query_log.borrow_mut().clear();
    }

    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_query_log(&self, path: &Path) -> Result<()> {
        write_statement_log(path, &self.query_log.borrow())
    }

    #[must_use]
    pub fn last_turn_state(&self) -> Option<TurnState> {
        self.last_state.get()
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.settings.chat.ai_chat_enabled {
            Ok(())
        } else {
            Err(GateError::chat_disabled().into())
        }
    }

    fn enter(&self, state: TurnState) {
        self.last_state.set(Some(state));
        tracing::debug!(state = state.as_str(), "chat turn state");
    }

    /// Persist the user message, title the thread and open this turn's
    /// interceptor.
    fn begin_turn(&self, thread_id: ThreadId, question: &str) -> Result<LoggedConnection> {
        self.enter(TurnState::Received);
        self.store
            .append_message(&NewChatMessage::user(thread_id, question))?;
        generate_title_from_first_message(self.store, thread_id)?;

        LoggedConnection::connect(
            &self.settings.database,
            &self.settings.security,
            Rc::clone(&self.audit),
        )
        .context("failed to open database for chat turn")
    }

    fn agent_request(&self, conn: &LoggedConnection, question: &str) -> Result<AgentRequest> {
        let schema = accessible_schema(conn.database())
            .context("failed to read the accessible schema")?;
        Ok(AgentRequest {
            question: question.to_string(),
            model: self.settings.chat.ai_model.clone(),
            instructions: data_analyst_instructions(&describe_schema(&schema)),
        })
    }

    fn invoke(&self, conn: &LoggedConnection, question: &str) -> Result<AgentReply> {
        let request = self.agent_request(conn, question)?;
        let runtime = ToolRuntime::new(conn, Rc::clone(&self.audit));
        self.backend.respond(&runtime, &request)
    }

    fn open_stream(&self, conn: &LoggedConnection, question: &str) -> Result<ChunkStream<'a>> {
        let request = self.agent_request(conn, question)?;
        let runtime = ToolRuntime::new(conn, Rc::clone(&self.audit));
        self.backend.stream(&runtime, &request)
    }

    fn finish_stream(
        &self,
        thread_id: ThreadId,
        conn: &LoggedConnection,
        content: String,
    ) -> Result<ChatMessage> {
        self.remember_log(conn);
        let query_generated = conn.last_query();
        let message = self.store.append_message(&NewChatMessage {
            thread_id,
            role: MessageRole::Assistant,
            content,
            query_generated: query_generated.clone(),
            metadata: json!({
                "provider": self.settings.chat.ai_provider,
                "model": self.settings.chat.ai_model,
                "streaming": true,
                "query_generated": query_generated,
            }),
        })?;
        self.enter(TurnState::Succeeded);
        Ok(message)
    }

    fn stream_failed(&self, thread_id: ThreadId, question: &str, err: &anyhow::Error) {
        self.enter(TurnState::Failed);
        tracing::error!(
            thread_id = %thread_id,
            question = %question,
            error = %format!("{err:#}"),
            "chat service streaming error"
        );
    }

    fn remember_log(&self, conn: &LoggedConnection) {
        *self.query_log.borrow_mut() = conn.statements();
    }
}

#[cfg(test)]
mod tests {
    use super::{backend_for, select_backend, TurnState};
    use query_gate_config::{AgentBackendKind, Settings};

    #[test]
    fn backend_routing_follows_settings() {
        let mut settings = Settings::default();
        assert_eq!(select_backend(&settings).backend_name(), "http_json");

        settings.chat.agent_backend = AgentBackendKind::Mock;
        assert_eq!(select_backend(&settings).backend_name(), "mock");
        assert_eq!(
            backend_for(AgentBackendKind::HttpJson, &settings).backend_name(),
            "http_json"
        );
    }

    #[test]
    fn turn_states_have_stable_names() {
        let names: Vec<&str> = [
            TurnState::Received,
            TurnState::AgentInvoked,
            TurnState::Succeeded,
            TurnState::Failed,
        ]
        .into_iter()
        .map(TurnState::as_str)
        .collect();
        assert_eq!(names, vec!["received", "agent_invoked", "succeeded", "failed"]);
    }
}
