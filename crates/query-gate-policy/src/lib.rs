#![forbid(unsafe_code)]

//! Read-only enforcement for agent-issued SQL.
//!
//! Every layer shares [`classify_statement`]: a case-insensitive whole-word
//! scan of the full statement text for write keywords. It is a heuristic,
//! not a parser. A write hidden inside a stored procedure call, or a keyword
//! assembled from string concatenation, is not detected.

use std::sync::OnceLock;

use query_gate_domain::Verdict;
use regex::Regex;

mod guard;
mod listener;

pub use guard::{ToolCallGuard, BLOCKED_WRITE_MESSAGE, QUERY_EXECUTED_MESSAGE};
pub use listener::{BreachListener, BREACH_AUDIT_MESSAGE};

pub const WRITE_KEYWORDS: [&str; 7] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE",
];

const WRITE_KEYWORD_PATTERN: &str = r"(?i)\b(INSERT|UPDATE|DELETE|DROP|TRUNCATE|ALTER|CREATE)\b";

fn write_keyword_regex() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| match Regex::new(WRITE_KEYWORD_PATTERN) {
        Ok(regex) => regex,
        Err(err) => unreachable!("write keyword pattern is a valid regex: {err}"),
    })
}

/// Classify a statement as [`Verdict::Write`] when any write keyword occurs
/// as a whole word anywhere in it, [`Verdict::Read`] otherwise.
#[must_use]
pub fn classify_statement(sql: &str) -> Verdict {
    if write_keyword_regex().is_match(sql) {
        Verdict::Write
    } else {
        Verdict::Read
    }
}

#[must_use]
pub fn is_write_statement(sql: &str) -> bool {
    classify_statement(sql).is_write()
}

/// The first write keyword found, upper-cased.
#[must_use]
pub fn first_write_keyword(sql: &str) -> Option<String> {
    write_keyword_regex()
        .find(sql)
        .map(|found| found.as_str().to_ascii_uppercase())
}
