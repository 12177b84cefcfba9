#![forbid(unsafe_code)]

use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use query_gate_domain::{
    ensure_non_empty, now_utc, ChatMessage, ChatThread, MessageId, MessageRole, NewChatMessage,
    ThreadId,
};
use query_gate_store_core::ChatStore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use ulid::Ulid;

const CHAT_SCHEMA_VERSION: i64 = 1;

const CHAT_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS chat_schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
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

CREATE INDEX IF NOT EXISTS idx_chat_messages_thread
  ON chat_messages(thread_id, message_seq);

CREATE TRIGGER IF NOT EXISTS trg_chat_messages_no_update
BEFORE UPDATE ON chat_messages
BEGIN
  SELECT RAISE(FAIL, 'chat_messages is append-only');
END;
CREATE TRIGGER IF NOT EXISTS trg_chat_messages_no_delete
BEFORE DELETE ON chat_messages
BEGIN
  SELECT RAISE(FAIL, 'chat_messages is append-only');
END;
";

const MESSAGE_COLUMNS: &str =
    "message_id, thread_id, role, content, query_generated, metadata_json, created_at";

/// Chat threads and messages on their own `SQLite` connection, outside the
/// observed application database.
pub struct SqliteChatStore {
    conn: Connection,
}

impl SqliteChatStore {
    /// Open or create a `SQLite` chat database and configure local pragmas.
    ///
    /// # Errors
    /// Returns an error if opening the database or applying pragmas fails.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }
}

impl ChatStore for SqliteChatStore {
    fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(CHAT_SCHEMA)
            .context("failed to apply chat schema")?;

        let now = rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO chat_schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CHAT_SCHEMA_VERSION, now],
            )
            .context("failed to record chat migration")?;

        Ok(())
    }

    fn create_thread(&self, user_id: &str, title: Option<&str>) -> Result<ChatThread> {
        ensure_non_empty("user_id", user_id)?;
        let thread = ChatThread {
            thread_id: ThreadId::new(),
            user_id: user_id.to_string(),
            title: title
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            created_at: now_utc(),
        };

        self.conn
            .execute(
                "INSERT INTO chat_threads(thread_id, user_id, title, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    thread.thread_id.to_string(),
                    thread.user_id,
                    thread.title,
                    rfc3339(thread.created_at)?,
                ],
            )
            .context("failed to insert chat thread")?;
        Ok(thread)
    }

    fn get_thread(&self, thread_id: ThreadId) -> Result<Option<ChatThread>> {
        let row = self
            .conn
            .query_row(
                "SELECT thread_id, user_id, title, created_at FROM chat_threads WHERE thread_id = ?1",
                params![thread_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .context("failed to load chat thread")?;

        row.map(|(thread_id, user_id, title, created_at)| {
            Ok(ChatThread {
                thread_id: parse_thread_id(&thread_id)?,
                user_id,
                title,
                created_at: parse_rfc3339(&created_at)?,
            })
        })
        .transpose()
    }

    fn append_message(&self, message: &NewChatMessage) -> Result<ChatMessage> {
        let stored = ChatMessage {
            message_id: MessageId::new(),
            thread_id: message.thread_id,
            role: message.role,
            content: message.content.clone(),
            query_generated: message.query_generated.clone(),
            metadata: message.metadata.clone(),
            created_at: now_utc(),
        };

        self.conn
            .execute(
                &format!("INSERT INTO chat_messages({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    stored.message_id.to_string(),
                    stored.thread_id.to_string(),
                    stored.role.as_str(),
                    stored.content,
                    stored.query_generated,
                    serde_json::to_string(&stored.metadata)?,
                    rfc3339(stored.created_at)?,
                ],
            )
            .with_context(|| format!("failed to append chat message to thread {}", stored.thread_id))?;
        Ok(stored)
    }

    fn list_messages(&self, thread_id: ThreadId) -> Result<Vec<ChatMessage>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE thread_id = ?1 ORDER BY message_seq ASC"
            ))
            .context("failed to prepare chat message listing")?;
        let mut rows = stmt.query(params![thread_id.to_string()])?;

        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(message_from_row(row)?);
        }
        Ok(out)
    }

    fn set_thread_title(&self, thread_id: ThreadId, title: &str) -> Result<()> {
        ensure_non_empty("title", title)?;
        let updated = self
            .conn
            .execute(
                "UPDATE chat_threads SET title = ?2 WHERE thread_id = ?1",
                params![thread_id.to_string(), title],
            )
            .context("failed to update chat thread title")?;
        if updated == 0 {
            return Err(anyhow!("unknown chat thread: {thread_id}"));
        }
        Ok(())
    }

    fn latest_assistant_query(&self, thread_id: ThreadId) -> Result<Option<String>> {
        let query = self
            .conn
            .query_row(
                "SELECT query_generated FROM chat_messages
                 WHERE thread_id = ?1 AND role = 'assistant'
                 ORDER BY message_seq DESC LIMIT 1",
                params![thread_id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .context("failed to load latest generated query")?;
        Ok(query.flatten())
    }
}

fn message_from_row(row: &Row<'_>) -> Result<ChatMessage> {
    let message_id: String = row.get(0)?;
    let thread_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let metadata_json: String = row.get(5)?;
    let created_at: String = row.get(6)?;

    Ok(ChatMessage {
        message_id: parse_message_id(&message_id)?,
        thread_id: parse_thread_id(&thread_id)?,
        role: MessageRole::parse(&role).ok_or_else(|| anyhow!("unknown message role: {role}"))?,
        content: row.get(3)?,
        query_generated: row.get(4)?,
        metadata: serde_json::from_str(&metadata_json)
            .context("failed to decode chat message metadata")?,
        created_at: parse_rfc3339(&created_at)?,
    })
}

fn parse_thread_id(value: &str) -> Result<ThreadId> {
    ThreadId::from_str(value)
}

fn parse_message_id(value: &str) -> Result<MessageId> {
    let ulid = Ulid::from_str(value).map_err(|err| anyhow!("invalid message_id ULID: {err}"))?;
    Ok(MessageId(ulid))
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid datetime format: {err}"))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| anyhow!("invalid RFC3339 datetime: {err}"))
}

#[cfg(test)]
mod tests {
    use super::SqliteChatStore;
    use query_gate_domain::{MessageRole, NewChatMessage, ThreadId};
    use query_gate_store_core::{generate_title_from_first_message, ChatStore};
    use serde_json::json;
    use ulid::Ulid;

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "query-gate-chat-sqlite-test-{}-{}.sqlite",
            name,
            Ulid::new()
        ))
    }

    fn migrated_store(name: &str) -> SqliteChatStore {
        let store = SqliteChatStore::open(&temp_db_path(name));
        assert!(store.is_ok());
        let store = store.unwrap_or_else(|_| unreachable!());
        assert!(store.migrate().is_ok());
        store
    }

    fn assistant(thread_id: ThreadId, content: &str, query: Option<&str>) -> NewChatMessage {
        NewChatMessage {
            thread_id,
            role: MessageRole::Assistant,
            content: content.to_string(),
            query_generated: query.map(str::to_string),
            metadata: json!({"provider": "openai", "model": "gpt-4"}),
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = migrated_store("migrate");
        assert!(store.migrate().is_ok());
    }

    #[test]
    fn messages_round_trip_in_append_order() {
        let store = migrated_store("round-trip");
        let thread = store.create_thread("user-1", None);
        assert!(thread.is_ok());
        let thread = thread.unwrap_or_else(|_| unreachable!());

        assert!(store
            .append_message(&NewChatMessage::user(thread.thread_id, "How many tasks?"))
            .is_ok());
        let reply = store.append_message(&assistant(
            thread.thread_id,
            "There are 3 tasks.",
            Some("SELECT COUNT(*) FROM tasks"),
        ));
        assert!(reply.is_ok());

        let messages = store
            .list_messages(thread.thread_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].content, "There are 3 tasks.");
        assert_eq!(messages[1].metadata["provider"], json!("openai"));
        assert_eq!(
            messages[1].query_generated.as_deref(),
            Some("SELECT COUNT(*) FROM tasks")
        );
    }

    #[test]
    fn chat_messages_are_append_only() {
        let store = migrated_store("append-only");
        let thread = store
            .create_thread("user-1", Some("Tasks"))
            .unwrap_or_else(|_| unreachable!());
        assert!(store
            .append_message(&NewChatMessage::user(thread.thread_id, "hello"))
            .is_ok());

        let mutated = store.conn.execute(
            "UPDATE chat_messages SET content = 'mutated' WHERE message_seq = 1",
            [],
        );
        assert!(mutated.is_err());
        let deleted = store
            .conn
            .execute("DELETE FROM chat_messages WHERE message_seq = 1", []);
        assert!(deleted.is_err());
    }

    #[test]
    fn appending_to_an_unknown_thread_fails() {
        let store = migrated_store("unknown-thread");
        assert!(store
            .append_message(&NewChatMessage::user(ThreadId::new(), "orphan"))
            .is_err());
        assert!(store.set_thread_title(ThreadId::new(), "title").is_err());
    }

    #[test]
    fn title_is_generated_once_from_first_user_message() {
        let store = migrated_store("title");
        let thread = store
            .create_thread("user-1", None)
            .unwrap_or_else(|_| unreachable!());
        assert!(store
            .append_message(&NewChatMessage::user(
                thread.thread_id,
                "Show me every workflow that failed during the nightly synchronisation run"
            ))
            .is_ok());

        let generated = generate_title_from_first_message(&store, thread.thread_id);
        assert!(generated.is_ok());
        let generated = generated.unwrap_or_else(|_| unreachable!());
        assert!(generated.as_deref().is_some_and(|t| t.ends_with("...")));

        assert!(store
            .append_message(&NewChatMessage::user(thread.thread_id, "second question"))
            .is_ok());
        let again = generate_title_from_first_message(&store, thread.thread_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(again, None);

        let stored = store
            .get_thread(thread.thread_id)
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());
        assert_eq!(stored.title, generated);
    }

    #[test]
    fn latest_assistant_query_reflects_only_the_newest_answer() {
        let store = migrated_store("latest-query");
        let thread = store
            .create_thread("user-1", None)
            .unwrap_or_else(|_| unreachable!());
        assert!(store
            .append_message(&assistant(thread.thread_id, "first", Some("SELECT 1")))
            .is_ok());
        assert!(store
            .append_message(&assistant(thread.thread_id, "Error: boom", None))
            .is_ok());

        let latest = store
            .latest_assistant_query(thread.thread_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(latest, None);

        assert!(store
            .append_message(&NewChatMessage::user(thread.thread_id, "and now?"))
            .is_ok());
        assert!(store
            .append_message(&assistant(thread.thread_id, "second", Some("SELECT 2")))
            .is_ok());
        let latest = store
            .latest_assistant_query(thread.thread_id)
            .unwrap_or_else(|_| unreachable!());
        assert_eq!(latest.as_deref(), Some("SELECT 2"));
        assert_eq!(
            store
                .latest_assistant_query(ThreadId::new())
                .unwrap_or_else(|_| unreachable!()),
            None
        );
    }
}
