#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use query_gate_domain::{ChatMessage, ChatThread, MessageRole, NewChatMessage, ThreadId};

pub const TITLE_MAX_CHARS: usize = 50;

pub trait ChatStore {
    #[allow(clippy::missing_errors_doc)]
    fn migrate(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn create_thread(&self, user_id: &str, title: Option<&str>) -> Result<ChatThread>;

    #[allow(clippy::missing_errors_doc)]
    fn get_thread(&self, thread_id: ThreadId) -> Result<Option<ChatThread>>;

    #[allow(clippy::missing_errors_doc)]
    fn append_message(&self, message: &NewChatMessage) -> Result<ChatMessage>;

    #[allow(clippy::missing_errors_doc)]
    fn list_messages(&self, thread_id: ThreadId) -> Result<Vec<ChatMessage>>;

    #[allow(clippy::missing_errors_doc)]
    fn set_thread_title(&self, thread_id: ThreadId, title: &str) -> Result<()>;

    /// SQL recorded on the newest assistant message; `None` when that
    /// message ran none, even if an older one did.
    #[allow(clippy::missing_errors_doc)]
    fn latest_assistant_query(&self, thread_id: ThreadId) -> Result<Option<String>>;
}

/// Derive a thread title from message text: trimmed, cut to
/// [`TITLE_MAX_CHARS`] characters with a `...` suffix when cut.
#[must_use]
pub fn title_from_message(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}

/// Give an untitled thread the title of its first user message.
/// Returns the title that was set, or `None` when nothing changed.
///
/// # Errors
/// Returns an error if the thread is unknown or the store fails.
pub fn generate_title_from_first_message(
    store: &dyn ChatStore,
    thread_id: ThreadId,
) -> Result<Option<String>> {
    let thread = store
        .get_thread(thread_id)?
        .ok_or_else(|| anyhow!("unknown chat thread: {thread_id}"))?;
    if thread
        .title
        .as_deref()
        .is_some_and(|title| !title.trim().is_empty())
    {
        return Ok(None);
    }

    let messages = store.list_messages(thread_id)?;
    let Some(first) = messages
        .iter()
        .find(|message| message.role == MessageRole::User)
    else {
        return Ok(None);
    };

    let title = title_from_message(&first.content);
    if title.is_empty() {
        return Ok(None);
    }
    store.set_thread_title(thread_id, &title)?;
    Ok(Some(title))
}
