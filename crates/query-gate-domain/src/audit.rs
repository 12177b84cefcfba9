use std::cell::RefCell;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Error,
    Critical,
}

impl AuditSeverity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub severity: AuditSeverity,
    pub message: String,
    pub context: Map<String, Value>,
}

impl AuditEntry {
    #[must_use]
    pub fn new(severity: AuditSeverity, message: &str, context: Map<String, Value>) -> Self {
        Self {
            severity,
            message: message.to_string(),
            context,
        }
    }

    #[must_use]
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(Value::as_str)
    }
}

/// Destination for security audit entries.
pub trait AuditSink {
    fn record(&self, entry: AuditEntry);
}

/// Forwards audit entries to `tracing` under the `query_gate::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let context = Value::Object(entry.context);
        match entry.severity {
            AuditSeverity::Info => tracing::info!(
                target: "query_gate::audit",
                severity = entry.severity.as_str(),
                context = %context,
                "{}",
                entry.message
            ),
            AuditSeverity::Error | AuditSeverity::Critical => tracing::error!(
                target: "query_gate::audit",
                severity = entry.severity.as_str(),
                context = %context,
                "{}",
                entry.message
            ),
        }
    }
}

/// Keeps every entry in memory, in arrival order.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: RefCell<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.borrow().clone()
    }

    #[must_use]
    pub fn with_severity(&self, severity: AuditSeverity) -> Vec<AuditEntry> {
        self.entries
            .borrow()
            .iter()
            .filter(|entry| entry.severity == severity)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.borrow_mut().push(entry);
    }
}
