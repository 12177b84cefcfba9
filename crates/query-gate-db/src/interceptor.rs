use std::cell::{Cell, RefCell};
use std::fs;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context, Result};
use query_gate_config::{DatabaseSettings, SecuritySettings};
use query_gate_domain::{hash_sql, now_utc, AuditSink, GateError, StatementRecord};
use query_gate_policy::first_write_keyword;

use crate::{Database, PreparedQuery, ResultSet};

/// Read-only front door to a [`Database`] for agent-issued SQL.
///
/// Writes are refused before they reach the driver. Every admitted statement
/// is appended to a turn-scoped log in submission order. One instance serves
/// one chat turn and is never shared between turns.
pub struct LoggedConnection {
    db: Database,
    log: RefCell<Vec<StatementRecord>>,
    last_sequence: Cell<u64>,
}

impl LoggedConnection {
    /// Open a fresh driver handle with the breach listener registered.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened.
    pub fn connect(
        database: &DatabaseSettings,
        security: &SecuritySettings,
        audit: Rc<dyn AuditSink>,
    ) -> Result<Self> {
        let db = Database::open_guarded(database, security, audit)?;
        Ok(Self::wrap(db))
    }

    #[must_use]
    pub fn wrap(db: Database) -> Self {
        Self {
            db,
            log: RefCell::new(Vec::new()),
            last_sequence: Cell::new(0),
        }
    }

    #[must_use]
    pub fn database(&self) -> &Database {
        &self.db
    }

    /// # Errors
    /// Returns [`GateError::Security`] for a write, or a driver error.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery<'_>> {
        self.admit(sql)?;
        self.db.prepare(sql)
    }

    /// # Errors
    /// Returns [`GateError::Security`] for a write, or a driver error.
    pub fn query(&self, sql: &str) -> Result<ResultSet> {
        self.admit(sql)?;
        self.db.query(sql, &[])
    }

    #[must_use]
    pub fn last_query(&self) -> Option<String> {
        self.log.borrow().last().map(|record| record.sql.clone())
    }

    #[must_use]
    pub fn statements(&self) -> Vec<StatementRecord> {
        self.log.borrow().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.log.borrow().is_empty()
    }

    /// Empty the log. Sequence numbers keep counting.
    pub fn clear_log(&self) {
        self.log.borrow_mut().clear();
    }

    /// Overwrite `path` with the logged SQL, one statement per line.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_log_to_file(&self, path: &Path) -> Result<()> {
        write_statement_log(path, &self.log.borrow())
    }

    fn admit(&self, sql: &str) -> Result<()> {
        if let Some(keyword) = first_write_keyword(sql) {
            tracing::warn!(keyword = %keyword, sql = %sql, "statement interceptor refused write");
            return Err(GateError::write_blocked().into());
        }

        let sequence = self.last_sequence.get() + 1;
        self.last_sequence.set(sequence);
        self.log.borrow_mut().push(StatementRecord {
            sequence,
            sql: sql.to_string(),
            sql_hash: hash_sql(sql),
            recorded_at: now_utc(),
        });
        Ok(())
    }
}

/// Overwrite `path` with `records`' SQL, one statement per line, each
/// followed by a newline.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_statement_log(path: &Path, records: &[StatementRecord]) -> Result<()> {
    let mut content = String::new();
    for record in records {
        content.push_str(&record.sql);
        content.push('\n');
    }
    fs::write(path, content)
        .with_context(|| format!("failed to write statement log to {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::LoggedConnection;
    use crate::test_support::temp_db_settings;
    use crate::{migrate_application_schema, Database};
    use query_gate_config::SecuritySettings;
    use query_gate_domain::{find_gate_error, hash_sql, GateError, MemoryAuditSink};
    use std::rc::Rc;
    use ulid::Ulid;

    fn connection(name: &str) -> LoggedConnection {
        let sink = Rc::new(MemoryAuditSink::new());
        let conn = LoggedConnection::connect(
            &temp_db_settings(name),
            &SecuritySettings::default(),
            sink,
        );
        assert!(conn.is_ok());
        let conn = conn.unwrap_or_else(|_| unreachable!());
        assert!(migrate_application_schema(conn.database()).is_ok());
        conn
    }

    fn assert_blocked(result: anyhow::Result<impl Sized>) {
        match result {
            Ok(_) => panic!("write should have been blocked"),
            Err(err) => {
                assert_eq!(find_gate_error(&err), Some(&GateError::write_blocked()));
                assert!(err.to_string().contains("Write operation detected and blocked"));
            }
        }
    }

    #[test]
    fn blocks_every_write_keyword_through_query_and_prepare() {
        let conn = connection("blocks");
        for sql in [
            "INSERT INTO tasks (name) VALUES ('hack')",
            "UPDATE tasks SET name = 'hacked'",
            "DELETE FROM tasks",
            "DROP TABLE tasks",
            "TRUNCATE tasks",
            "ALTER TABLE tasks ADD COLUMN x TEXT",
            "create table shadow (id integer)",
        ] {
            assert_blocked(conn.query(sql));
            assert_blocked(conn.prepare(sql).map(|_| ()));
        }
        assert!(conn.is_empty());
        assert_eq!(conn.last_query(), None);
    }

    #[test]
    fn reads_are_logged_in_submission_order() {
        let conn = connection("order");
        let statements = [
            "SELECT COUNT(*) FROM workflows",
            "SELECT name FROM tasks WHERE id = 1",
            "SELECT updated_at FROM customers",
        ];
        for sql in statements {
            assert!(conn.query(sql).is_ok(), "{sql}");
        }

        let records = conn.statements();
        assert_eq!(records.len(), 3);
        let sqls: Vec<&str> = records.iter().map(|record| record.sql.as_str()).collect();
        assert_eq!(sqls, statements);
        let sequences: Vec<u64> = records.iter().map(|record| record.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(records[1].sql_hash, hash_sql(statements[1]));
        assert_eq!(conn.last_query().as_deref(), Some(statements[2]));
    }

    #[test]
    fn prepared_reads_are_logged_before_they_run() {
        let conn = connection("prepare");
        let prepared = conn.prepare("SELECT * FROM workflows WHERE id = ?1");
        assert!(prepared.is_ok());
        let mut prepared = prepared.unwrap_or_else(|_| unreachable!());
        assert!(prepared.run(&[serde_json::json!(1)]).is_ok());
        assert_eq!(
            conn.last_query().as_deref(),
            Some("SELECT * FROM workflows WHERE id = ?1")
        );
    }

    #[test]
    fn clear_log_empties_it_and_sequence_keeps_counting() {
        let conn = connection("clear");
        assert!(conn.query("SELECT 1").is_ok());
        assert!(conn.query("SELECT 2").is_ok());
        conn.clear_log();
        assert!(conn.is_empty());
        assert_eq!(conn.len(), 0);
        assert_eq!(conn.last_query(), None);

        assert!(conn.query("SELECT 3").is_ok());
        let records = conn.statements();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].sequence, 3);
    }

    #[test]
    fn failing_reads_are_still_logged() {
        let conn = connection("failing");
        assert!(conn.query("SELECT * FROM no_such_table").is_err());
        assert_eq!(conn.last_query().as_deref(), Some("SELECT * FROM no_such_table"));
    }

    #[test]
    fn saved_log_reads_back_in_order_and_overwrites() {
        let conn = connection("save");
        let path = std::env::temp_dir().join(format!("query-gate-log-{}.sql", Ulid::new()));
        assert!(std::fs::write(&path, "stale content\n").is_ok());

        let statements = ["SELECT * FROM tasks", "SELECT * FROM workflows"];
        for sql in statements {
            assert!(conn.query(sql).is_ok());
        }
        assert!(conn.save_log_to_file(&path).is_ok());

        let content = std::fs::read_to_string(&path).unwrap_or_else(|_| unreachable!());
        assert_eq!(content, "SELECT * FROM tasks\nSELECT * FROM workflows\n");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, statements);
    }

    #[test]
    fn wrapping_an_unguarded_database_still_refuses_writes() {
        let db = Database::open(&temp_db_settings("wrap"));
        assert!(db.is_ok());
        let conn = LoggedConnection::wrap(db.unwrap_or_else(|_| unreachable!()));
        assert!(conn.database().observer_names().is_empty());
        assert_blocked(conn.query("DELETE FROM tasks"));
    }
}
