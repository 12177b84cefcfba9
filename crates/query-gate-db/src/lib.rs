#![forbid(unsafe_code)]

use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use query_gate_config::{DatabaseSettings, SecuritySettings};
use query_gate_domain::{AuditSink, ExecutedStatement, StatementObserver};
use query_gate_policy::BreachListener;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Statement};
use serde::Serialize;
use serde_json::{Map, Value};

mod interceptor;
mod schema;

pub use interceptor::{write_statement_log, LoggedConnection};
pub use schema::{
    accessible_schema, describe_schema, migrate_application_schema, SchemaColumn,
    ACCESSIBLE_SCHEMA_VIEW, APPLICATION_SCHEMA_VERSION,
};

/// Rows returned by one statement, values already converted to JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row `index` as a column-name keyed object.
    #[must_use]
    pub fn row_object(&self, index: usize) -> Option<Map<String, Value>> {
        let row = self.rows.get(index)?;
        Some(
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect(),
        )
    }

    #[must_use]
    pub fn to_objects(&self, limit: usize) -> Vec<Value> {
        (0..self.rows.len().min(limit))
            .filter_map(|index| self.row_object(index).map(Value::Object))
            .collect()
    }
}

/// A `SQLite` handle that reports every executed statement to its observers.
///
/// Observers run after the driver has executed the statement. An observer
/// error fails the call; wrap writes in [`Database::unit_of_work`] so that
/// failure also undoes them.
pub struct Database {
    conn: Connection,
    observers: Vec<Box<dyn StatementObserver>>,
}

impl Database {
    /// Open or create the application database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(settings: &DatabaseSettings) -> Result<Self> {
        Self::open_path(&settings.path, settings.busy_timeout_ms)
    }

    /// Open the database with the write-breach listener registered.
    ///
    /// # Errors
    /// Returns an error if opening the database fails.
    pub fn open_guarded(
        settings: &DatabaseSettings,
        security: &SecuritySettings,
        audit: Rc<dyn AuditSink>,
    ) -> Result<Self> {
        let mut db = Self::open(settings)?;
        db.register_observer(Box::new(BreachListener::new(
            security.enable_ai_security_listener,
            audit,
        )));
        Ok(db)
    }

    fn open_path(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
        .context("failed to configure sqlite pragmas")?;

        Ok(Self {
            conn,
            observers: Vec::new(),
        })
    }

    pub fn register_observer(&mut self, observer: Box<dyn StatementObserver>) {
        tracing::debug!(observer = observer.observer_name(), "statement observer registered");
        self.observers.push(observer);
    }

    #[must_use]
    pub fn observer_names(&self) -> Vec<&'static str> {
        self.observers
            .iter()
            .map(|observer| observer.observer_name())
            .collect()
    }

    /// Execute a statement that returns no rows.
    ///
    /// # Errors
    /// Returns an error if the driver rejects the statement or an observer
    /// aborts it.
    pub fn execute(&self, sql: &str, bindings: &[Value]) -> Result<usize> {
        let started = Instant::now();
        let changed = self
            .conn
            .execute(sql, params_from_iter(bindings.iter().map(to_sql_value)))
            .with_context(|| format!("failed to execute statement: {sql}"))?;
        self.notify(sql, bindings, started.elapsed())?;
        Ok(changed)
    }

    /// Run a statement and collect every row.
    ///
    /// # Errors
    /// Returns an error if the driver rejects the statement or an observer
    /// aborts it.
    pub fn query(&self, sql: &str, bindings: &[Value]) -> Result<ResultSet> {
        let mut prepared = self.prepare(sql)?;
        prepared.run(bindings)
    }

    /// # Errors
    /// Returns an error if the statement cannot be compiled.
    pub fn prepare(&self, sql: &str) -> Result<PreparedQuery<'_>> {
        let statement = self
            .conn
            .prepare(sql)
            .with_context(|| format!("failed to prepare statement: {sql}"))?;
        Ok(PreparedQuery {
            db: self,
            statement,
            sql: sql.to_string(),
        })
    }

    /// Run `work` inside `BEGIN`/`COMMIT`, rolling back when either `work` or
    /// the commit fails.
    ///
    /// # Errors
    /// Returns the error from `work`, or an error if the transaction cannot
    /// be opened or committed.
    pub fn unit_of_work<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Self) -> Result<T>,
    {
        self.conn
            .execute_batch("BEGIN")
            .context("failed to begin unit of work")?;

        let outcome = work(self).and_then(|value| {
            self.conn
                .execute_batch("COMMIT")
                .context("failed to commit unit of work")?;
            Ok(value)
        });
        if outcome.is_err() && !self.conn.is_autocommit() {
            self.rollback();
        }
        outcome
    }

    fn rollback(&self) {
        if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(error = %rollback_err, "failed to roll back unit of work");
        }
    }

    /// Raw handle for bootstrap work that must not reach the observers.
    pub(crate) fn bootstrap_connection(&self) -> &Connection {
        &self.conn
    }

    fn notify(&self, sql: &str, bindings: &[Value], elapsed: Duration) -> Result<()> {
        if self.observers.is_empty() {
            return Ok(());
        }

        let statement = ExecutedStatement {
            sql: sql.to_string(),
            bindings: bindings.to_vec(),
            elapsed,
        };
        for observer in &self.observers {
            if let Err(err) = observer.observe(&statement) {
                tracing::debug!(
                    observer = observer.observer_name(),
                    error = %err,
                    "statement observer aborted execution"
                );
                return Err(err.into());
            }
        }
        Ok(())
    }
}

/// A compiled statement bound to its [`Database`]; every run is observed.
pub struct PreparedQuery<'db> {
    db: &'db Database,
    statement: Statement<'db>,
    sql: String,
}

impl PreparedQuery<'_> {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// # Errors
    /// Returns an error if execution fails or an observer aborts it.
    pub fn run(&mut self, bindings: &[Value]) -> Result<ResultSet> {
        let started = Instant::now();
        let columns: Vec<String> = self
            .statement
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        let width = columns.len();

        let mut out = Vec::new();
        {
            let mut rows = self
                .statement
                .query(params_from_iter(bindings.iter().map(to_sql_value)))
                .with_context(|| format!("failed to run statement: {}", self.sql))?;
            while let Some(row) = rows.next().context("failed to read result row")? {
                let mut values = Vec::with_capacity(width);
                for index in 0..width {
                    values.push(column_value(row.get_ref(index)?));
                }
                out.push(values);
            }
        }

        self.db.notify(&self.sql, bindings, started.elapsed())?;
        Ok(ResultSet { columns, rows: out })
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => SqlValue::Integer(integer),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn column_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(integer) => Value::from(integer),
        ValueRef::Real(real) => serde_json::Number::from_f64(real).map_or(Value::Null, Value::Number),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(hex::encode(bytes)),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use query_gate_config::DatabaseSettings;
    use ulid::Ulid;

    pub fn temp_db_settings(name: &str) -> DatabaseSettings {
        DatabaseSettings {
            path: std::env::temp_dir().join(format!(
                "query-gate-db-test-{}-{}.sqlite",
                name,
                Ulid::new()
            )),
            busy_timeout_ms: 5_000,
        }
    }
}
