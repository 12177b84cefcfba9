use anyhow::{anyhow, Context, Result};
use query_gate_domain::now_utc;
use rusqlite::params;
use serde::Serialize;
use serde_json::Value;

use crate::Database;

pub const APPLICATION_SCHEMA_VERSION: i64 = 1;
pub const ACCESSIBLE_SCHEMA_VIEW: &str = "ai_accessible_schema";

const APPLICATION_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  email TEXT NOT NULL UNIQUE,
  password TEXT NOT NULL,
  remember_token TEXT,
  created_at TEXT,
  updated_at TEXT
);

CREATE TABLE IF NOT EXISTS settings (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  group_name TEXT NOT NULL,
  name TEXT NOT NULL,
  locked INTEGER NOT NULL DEFAULT 0 CHECK (locked IN (0,1)),
  payload TEXT NOT NULL,
  created_at TEXT,
  updated_at TEXT,
  UNIQUE(group_name, name)
);

CREATE TABLE IF NOT EXISTS failed_jobs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  uuid TEXT NOT NULL UNIQUE,
  connection TEXT NOT NULL,
  queue TEXT NOT NULL,
  payload TEXT NOT NULL,
  exception TEXT NOT NULL,
  failed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS customers (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  zuora_instance TEXT,
  client_id TEXT,
  client_secret TEXT,
  created_at TEXT,
  updated_at TEXT
);

CREATE TABLE IF NOT EXISTS workflows (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  customer_id INTEGER,
  zuora_id TEXT,
  name TEXT NOT NULL,
  description TEXT,
  state TEXT,
  version TEXT,
  created_on TEXT,
  updated_on TEXT,
  last_synced_at TEXT,
  json_export TEXT,
  created_at TEXT,
  updated_at TEXT,
  FOREIGN KEY (customer_id) REFERENCES customers(id)
);

CREATE TABLE IF NOT EXISTS tasks (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  workflow_id INTEGER,
  task_id TEXT NOT NULL,
  name TEXT NOT NULL,
  action_type TEXT,
  object TEXT,
  priority TEXT,
  state TEXT,
  created_at TEXT,
  updated_at TEXT,
  FOREIGN KEY (workflow_id) REFERENCES workflows(id)
);

CREATE TABLE IF NOT EXISTS chat_threads (
  thread_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL,
  title TEXT,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chat_messages (
  message_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  message_id TEXT NOT NULL UNIQUE,
  thread_id TEXT NOT NULL,
  role TEXT NOT NULL CHECK (role IN ('user','assistant')),
  content TEXT NOT NULL,
  query_generated TEXT,
  metadata_json TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (thread_id) REFERENCES chat_threads(thread_id)
);
";

/// Columns an agent may see. Credentials, tokens and framework tables are
/// absent on purpose; `customers` is listed without `client_id`/`client_secret`.
const ACCESSIBLE_COLUMNS: &[(&str, &[&str])] = &[
    (
        "customers",
        &["id", "name", "zuora_instance", "created_at", "updated_at"],
    ),
    (
        "workflows",
        &[
            "id",
            "customer_id",
            "zuora_id",
            "name",
            "description",
            "state",
            "version",
            "created_on",
            "updated_on",
            "last_synced_at",
            "created_at",
            "updated_at",
        ],
    ),
    (
        "tasks",
        &[
            "id",
            "workflow_id",
            "task_id",
            "name",
            "action_type",
            "object",
            "priority",
            "state",
            "created_at",
            "updated_at",
        ],
    ),
    ("chat_threads", &["thread_id", "user_id", "title", "created_at"]),
    (
        "chat_messages",
        &[
            "message_id",
            "thread_id",
            "role",
            "content",
            "query_generated",
            "created_at",
        ],
    ),
];

/// One (table, column) pair exposed through the schema view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaColumn {
    pub table_name: String,
    pub column_name: String,
    pub data_type: String,
}

/// Create the application tables and (re)build the schema exposure view.
///
/// Runs on the raw connection so the DDL never reaches the statement
/// observers.
///
/// # Errors
/// Returns an error if any DDL statement fails.
pub fn migrate_application_schema(db: &Database) -> Result<()> {
    let conn = db.bootstrap_connection();
    conn.execute_batch(APPLICATION_SCHEMA)
        .context("failed to apply application schema")?;
    conn.execute_batch(&accessible_schema_view_sql())
        .context("failed to build accessible schema view")?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![APPLICATION_SCHEMA_VERSION, rfc3339(now_utc())?],
    )
    .context("failed to record application migration")?;

    tracing::info!(
        version = APPLICATION_SCHEMA_VERSION,
        view = ACCESSIBLE_SCHEMA_VIEW,
        "application schema migrated"
    );
    Ok(())
}

fn accessible_schema_view_sql() -> String {
    let pairs: Vec<String> = ACCESSIBLE_COLUMNS
        .iter()
        .flat_map(|(table, columns)| {
            columns
                .iter()
                .map(move |column| format!("'{table}.{column}'"))
        })
        .collect();

    format!(
        "DROP VIEW IF EXISTS {ACCESSIBLE_SCHEMA_VIEW};
CREATE VIEW {ACCESSIBLE_SCHEMA_VIEW} AS
SELECT m.name AS table_name, p.name AS column_name, p.type AS data_type
FROM sqlite_master AS m
JOIN pragma_table_info(m.name) AS p
WHERE m.type = 'table'
  AND (m.name || '.' || p.name) IN ({})
ORDER BY m.name, p.cid;",
        pairs.join(", ")
    )
}

/// Read the schema exposure view.
///
/// # Errors
/// Returns an error if the view is missing or a row is malformed.
pub fn accessible_schema(db: &Database) -> Result<Vec<SchemaColumn>> {
    let result = db.query(
        &format!("SELECT table_name, column_name, data_type FROM {ACCESSIBLE_SCHEMA_VIEW}"),
        &[],
    )?;

    result
        .rows
        .iter()
        .map(|row| {
            Ok(SchemaColumn {
                table_name: text_cell(row, 0)?,
                column_name: text_cell(row, 1)?,
                data_type: text_cell(row, 2)?,
            })
        })
        .collect()
}

/// Render the schema boundary as one `table(column TYPE, ...)` line per table.
#[must_use]
pub fn describe_schema(columns: &[SchemaColumn]) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut current: Option<&str> = None;
    let mut fields: Vec<String> = Vec::new();

    for column in columns {
        if current != Some(column.table_name.as_str()) {
            if let Some(table) = current {
                lines.push(format!("{table}({})", fields.join(", ")));
                fields.clear();
            }
            current = Some(column.table_name.as_str());
        }
        fields.push(format!("{} {}", column.column_name, column.data_type).trim_end().to_string());
    }
    if let Some(table) = current {
        lines.push(format!("{table}({})", fields.join(", ")));
    }
    lines.join("\n")
}

fn text_cell(row: &[Value], index: usize) -> Result<String> {
    match row.get(index) {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Null) => Ok(String::new()),
        other => Err(anyhow!("unexpected schema view cell at {index}: {other:?}")),
    }
}

fn rfc3339(value: time::OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

#[cfg(test)]
mod tests {
    use super::{accessible_schema, describe_schema, migrate_application_schema, SchemaColumn};
    use crate::test_support::temp_db_settings;
    use crate::Database;
    use query_gate_config::SecuritySettings;
    use query_gate_domain::MemoryAuditSink;
    use std::collections::BTreeSet;
    use std::rc::Rc;

    fn migrated(name: &str) -> (Database, Rc<MemoryAuditSink>) {
        let sink = Rc::new(MemoryAuditSink::new());
        let db = Database::open_guarded(
            &temp_db_settings(name),
            &SecuritySettings::default(),
            sink.clone(),
        );
        assert!(db.is_ok());
        let db = db.unwrap_or_else(|_| unreachable!());
        assert!(migrate_application_schema(&db).is_ok());
        (db, sink)
    }

    fn exposed_tables(db: &Database) -> BTreeSet<String> {
        let columns = accessible_schema(db).unwrap_or_else(|_| unreachable!());
        columns.into_iter().map(|column| column.table_name).collect()
    }

    #[test]
    fn migration_is_idempotent_and_does_not_trip_the_listener() {
        let (db, sink) = migrated("idempotent");
        assert!(migrate_application_schema(&db).is_ok());
        assert!(sink.entries().is_empty());

        let view = db.query(
            "SELECT name FROM sqlite_master WHERE type = 'view' AND name = 'ai_accessible_schema'",
            &[],
        );
        assert!(view.is_ok());
        assert_eq!(view.unwrap_or_else(|_| unreachable!()).len(), 1);
    }

    #[test]
    fn view_exposes_safe_tables() {
        let (db, _sink) = migrated("safe");
        let tables = exposed_tables(&db);
        for table in ["workflows", "tasks", "customers", "chat_threads", "chat_messages"] {
            assert!(tables.contains(table), "{table} missing from view");
        }
    }

    #[test]
    fn view_hides_sensitive_tables_and_columns() {
        let (db, _sink) = migrated("hidden");
        let tables = exposed_tables(&db);
        for table in ["users", "settings", "failed_jobs", "schema_migrations"] {
            assert!(!tables.contains(table), "{table} leaked into view");
        }

        let columns = accessible_schema(&db).unwrap_or_else(|_| unreachable!());
        assert!(!columns
            .iter()
            .any(|c| c.table_name == "customers" && c.column_name.starts_with("client_")));
        assert!(!columns.iter().any(|c| c.column_name == "metadata_json"));
        assert!(columns
            .iter()
            .any(|c| c.table_name == "tasks" && c.column_name == "name" && c.data_type == "TEXT"));
    }

    #[test]
    fn describe_groups_columns_per_table() {
        let columns = vec![
            SchemaColumn {
                table_name: "tasks".to_string(),
                column_name: "id".to_string(),
                data_type: "INTEGER".to_string(),
            },
            SchemaColumn {
                table_name: "tasks".to_string(),
                column_name: "name".to_string(),
                data_type: "TEXT".to_string(),
            },
            SchemaColumn {
                table_name: "workflows".to_string(),
                column_name: "state".to_string(),
                data_type: String::new(),
            },
        ];
        assert_eq!(
            describe_schema(&columns),
            "tasks(id INTEGER, name TEXT)\nworkflows(state)"
        );
        assert_eq!(describe_schema(&[]), "");
    }
}
