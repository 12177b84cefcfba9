use anyhow::Result;
use query_gate_config::{MockAgentSettings, MockRule};
use query_gate_domain::{ToolInvocation, DATABASE_QUERY_TOOL};
use serde_json::{json, Value};
use ulid::Ulid;

use crate::{AgentBackend, AgentReply, AgentRequest, ChunkStream, ToolOutcome, ToolRuntime};

/// Offline, deterministic backend: maps a question to SQL by keyword rules
/// and reports the row count.
#[derive(Debug, Clone)]
pub struct MockAgent {
    rules: Vec<MockRule>,
    fallback_sql: String,
}

impl MockAgent {
    #[must_use]
    pub fn new(settings: &MockAgentSettings) -> Self {
        Self {
            rules: settings.rules.clone(),
            fallback_sql: settings.fallback_sql.clone(),
        }
    }

    fn choose_sql(&self, question: &str) -> &str {
        let question = question.to_lowercase();
        self.rules
            .iter()
            .find(|rule| question.contains(&rule.contains.to_lowercase()))
            .map_or(self.fallback_sql.as_str(), |rule| rule.sql.as_str())
    }
}

impl Default for MockAgent {
    fn default() -> Self {
        Self::new(&MockAgentSettings::default())
    }
}

impl AgentBackend for MockAgent {
    fn backend_name(&self) -> &'static str {
        "mock"
    }

    fn respond(&self, runtime: &ToolRuntime<'_>, request: &AgentRequest) -> Result<AgentReply> {
        let invocation = ToolInvocation::new(
            DATABASE_QUERY_TOOL,
            &format!("mock_{}", Ulid::new()),
            json!({ "query": self.choose_sql(&request.question) }),
        );

        let answer = match runtime.execute(&invocation)? {
            ToolOutcome::Denied { message } => message,
            ToolOutcome::Rows(result) => {
                let count = result.len();
                match result.row_object(0) {
                    Some(row) => format!(
                        "Query returned {count} row(s). First row: {}",
                        Value::Object(row)
                    ),
                    None => format!("Query returned {count} row(s)."),
                }
            }
        };

        Ok(AgentReply {
            answer,
            tool_calls: 1,
        })
    }

    fn stream<'a>(
        &'a self,
        runtime: &ToolRuntime<'_>,
        request: &AgentRequest,
    ) -> Result<ChunkStream<'a>> {
        let reply = self.respond(runtime, request)?;
        let chunks: Vec<String> = reply
            .answer
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        Ok(Box::new(chunks.into_iter().map(Ok::<_, anyhow::Error>)))
    }
}

#[cfg(test)]
mod tests {
    use super::MockAgent;
    use crate::test_support::seeded_connection;
    use crate::{AgentBackend, AgentRequest, ToolRuntime, TOOL_DENIED_MESSAGE};
    use query_gate_config::{MockAgentSettings, MockRule};

    fn request(question: &str) -> AgentRequest {
        AgentRequest {
            question: question.to_string(),
            model: "gpt-4".to_string(),
            instructions: String::new(),
        }
    }

    fn agent_with_rules(rules: &[(&str, &str)]) -> MockAgent {
        MockAgent::new(&MockAgentSettings {
            rules: rules
                .iter()
                .map(|(contains, sql)| MockRule {
                    contains: (*contains).to_string(),
                    sql: (*sql).to_string(),
                })
                .collect(),
            ..MockAgentSettings::default()
        })
    }

    #[test]
    fn fallback_counts_tasks() {
        let (conn, sink) = seeded_connection("mock-fallback");
        let runtime = ToolRuntime::new(&conn, sink);
        let agent = MockAgent::default();

        let reply = agent.respond(&runtime, &request("anything at all"));
        assert!(reply.is_ok());
        let reply = reply.unwrap_or_else(|_| unreachable!());
        assert_eq!(reply.answer, "Query returned 1 row(s). First row: {\"total\":2}");
        assert_eq!(
            conn.last_query().as_deref(),
            Some("SELECT COUNT(*) AS total FROM tasks")
        );
    }

    #[test]
    fn first_matching_rule_wins_case_insensitively() {
        let (conn, sink) = seeded_connection("mock-rules");
        let runtime = ToolRuntime::new(&conn, sink);
        let agent = agent_with_rules(&[
            ("ACTIVE", "SELECT name FROM tasks WHERE state = 'active' ORDER BY task_id"),
            ("task", "SELECT COUNT(*) AS total FROM tasks"),
        ]);

        let reply = agent
            .respond(&runtime, &request("Which active tasks exist?"))
            .unwrap_or_else(|_| unreachable!());
        assert!(reply.answer.starts_with("Query returned 2 row(s)."));
        assert!(reply.answer.contains("Sync invoices"));
    }

    #[test]
    fn write_rules_are_denied_by_the_guard() {
        let (conn, sink) = seeded_connection("mock-deny");
        let runtime = ToolRuntime::new(&conn, sink);
        let agent = agent_with_rules(&[("purge", "DELETE FROM tasks")]);

        let reply = agent
            .respond(&runtime, &request("purge everything"))
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(reply.answer, TOOL_DENIED_MESSAGE);
        assert!(conn.is_empty());
    }

    #[test]
    fn stream_chunks_concatenate_to_the_answer() {
        let (conn, sink) = seeded_connection("mock-stream");
        let runtime = ToolRuntime::new(&conn, sink);
        let agent = MockAgent::default();
        let question = request("how many?");

        let expected = agent
            .respond(&runtime, &question)
            .unwrap_or_else(|_| unreachable!())
            .answer;
        let chunks: Vec<String> = agent
            .stream(&runtime, &question)
            .unwrap_or_else(|_| unreachable!())
            .collect::<anyhow::Result<Vec<_>>>()
            .unwrap_or_else(|_| unreachable!());
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), expected);
    }
}
