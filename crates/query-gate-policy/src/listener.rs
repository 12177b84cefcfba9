use std::rc::Rc;

use query_gate_domain::{
    AuditEntry, AuditSeverity, AuditSink, ExecutedStatement, GateError, StatementObserver,
};
use serde_json::{Map, Value};

use crate::classify_statement;

pub const BREACH_AUDIT_MESSAGE: &str = "SECURITY BREACH: AI attempted write";

/// Last-line observer registered on every database handle.
///
/// Stateless apart from its enable flag. When enabled, any executed write
/// is reported at critical severity and the current unit of work is aborted
/// with [`GateError::Breach`]; when disabled it does nothing.
pub struct BreachListener {
    enabled: bool,
    audit: Rc<dyn AuditSink>,
}

impl BreachListener {
    #[must_use]
    pub fn new(enabled: bool, audit: Rc<dyn AuditSink>) -> Self {
        Self { enabled, audit }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl StatementObserver for BreachListener {
    fn observer_name(&self) -> &'static str {
        "breach_listener"
    }

    fn observe(&self, statement: &ExecutedStatement) -> Result<(), GateError> {
        if !self.enabled || !classify_statement(&statement.sql).is_write() {
            return Ok(());
        }

        let mut context = Map::new();
        context.insert("sql".to_string(), Value::String(statement.sql.clone()));
        context.insert(
            "bindings".to_string(),
            Value::Array(statement.bindings.clone()),
        );
        self.audit.record(AuditEntry::new(
            AuditSeverity::Critical,
            BREACH_AUDIT_MESSAGE,
            context,
        ));

        Err(GateError::breach(&statement.sql))
    }
}
