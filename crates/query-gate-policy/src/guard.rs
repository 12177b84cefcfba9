use std::rc::Rc;

use query_gate_domain::{AuditEntry, AuditSeverity, AuditSink, ToolDecision, ToolInvocation};
use serde_json::{json, Map, Value};

use crate::classify_statement;

pub const BLOCKED_WRITE_MESSAGE: &str = "AI Security: Blocked write operation";
pub const QUERY_EXECUTED_MESSAGE: &str = "AI Query Executed";

/// Pre-execution hook for agent tool calls.
///
/// Runs before the statement interceptor and independently of it, so either
/// one alone refuses a write. An invocation without a `query` argument is
/// inspected as an empty statement and therefore allowed.
pub struct ToolCallGuard {
    audit: Rc<dyn AuditSink>,
}

impl ToolCallGuard {
    #[must_use]
    pub fn new(audit: Rc<dyn AuditSink>) -> Self {
        Self { audit }
    }

    /// Decide whether the runtime may execute `invocation`.
    /// The runtime must not execute the tool when this returns [`ToolDecision::Deny`].
    #[must_use]
    pub fn before_tool_execution(&self, invocation: &ToolInvocation) -> ToolDecision {
        let sql = invocation.query_argument();

        if classify_statement(&sql).is_write() {
            self.audit.record(AuditEntry::new(
                AuditSeverity::Error,
                BLOCKED_WRITE_MESSAGE,
                context(&[
                    ("sql", json!(sql)),
                    ("tool", json!(invocation.tool_name)),
                    ("tool_call_id", json!(invocation.call_id)),
                ]),
            ));
            return ToolDecision::Deny;
        }

        self.audit.record(AuditEntry::new(
            AuditSeverity::Info,
            QUERY_EXECUTED_MESSAGE,
            context(&[("sql", json!(sql)), ("tool", json!(invocation.tool_name))]),
        ));
        ToolDecision::Allow
    }
}

fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{ToolCallGuard, BLOCKED_WRITE_MESSAGE, QUERY_EXECUTED_MESSAGE};
    use query_gate_domain::{
        AuditSeverity, MemoryAuditSink, ToolDecision, ToolInvocation, DATABASE_QUERY_TOOL,
    };
    use serde_json::json;
    use std::rc::Rc;

    fn guard() -> (ToolCallGuard, Rc<MemoryAuditSink>) {
        let sink = Rc::new(MemoryAuditSink::new());
        (ToolCallGuard::new(sink.clone()), sink)
    }

    fn invocation(call_id: &str, sql: &str) -> ToolInvocation {
        ToolInvocation::from_raw_arguments(
            DATABASE_QUERY_TOOL,
            call_id,
            &json!({ "query": sql }).to_string(),
        )
    }

    #[test]
    fn blocks_insert_and_records_error_entry() {
        let (guard, sink) = guard();
        let sql = "INSERT INTO tasks (name) VALUES ('hack')";

        let decision = guard.before_tool_execution(&invocation("call_123", sql));
        assert_eq!(decision, ToolDecision::Deny);

        let errors = sink.with_severity(AuditSeverity::Error);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, BLOCKED_WRITE_MESSAGE);
        assert_eq!(errors[0].context_str("sql"), Some(sql));
        assert_eq!(errors[0].context_str("tool"), Some(DATABASE_QUERY_TOOL));
        assert_eq!(errors[0].context_str("tool_call_id"), Some("call_123"));
        assert!(sink.with_severity(AuditSeverity::Info).is_empty());
    }

    #[test]
    fn blocks_update_and_delete() {
        let (guard, sink) = guard();
        for (call_id, sql) in [
            ("call_456", "UPDATE tasks SET name = \"hacked\" WHERE id = 1"),
            ("call_789", "DELETE FROM tasks WHERE id = 1"),
        ] {
            assert_eq!(
                guard.before_tool_execution(&invocation(call_id, sql)),
                ToolDecision::Deny
            );
        }
        let errors = sink.with_severity(AuditSeverity::Error);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].context_str("sql").unwrap_or_default().contains("UPDATE"));
        assert!(errors[1].context_str("sql").unwrap_or_default().contains("DELETE"));
    }

    #[test]
    fn allows_select_and_records_info_entry() {
        let (guard, sink) = guard();
        let sql = "SELECT * FROM tasks WHERE id = 1";

        let decision = guard.before_tool_execution(&invocation("call_1", sql));
        assert_eq!(decision, ToolDecision::Allow);

        let infos = sink.with_severity(AuditSeverity::Info);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].message, QUERY_EXECUTED_MESSAGE);
        assert_eq!(infos[0].context_str("sql"), Some(sql));
        assert!(infos[0].context.get("tool_call_id").is_none());
    }

    #[test]
    fn missing_query_argument_is_allowed() {
        let (guard, sink) = guard();
        let call = ToolInvocation::new(DATABASE_QUERY_TOOL, "call_2", json!({"sql": "DROP TABLE tasks"}));

        assert_eq!(guard.before_tool_execution(&call), ToolDecision::Allow);
        let infos = sink.with_severity(AuditSeverity::Info);
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].context_str("sql"), Some(""));
    }
}
