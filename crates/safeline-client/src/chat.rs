//! Chat threads.
//!
//! A thread is every message sharing a `threadKey`. Messages are appended
//! with a server-assigned `createdAt` and never edited.

use chrono::Utc;
use tracing::debug;

use safeline_shared::{ChatMessage, Record, SafelineError, Session, ValidationError};
use safeline_store::{Direction, DocumentStore, Query};

/// Messages of one thread, oldest first.
pub fn thread_query(thread_key: &str) -> Query {
    Query::collection(ChatMessage::COLLECTION)
        .where_eq("threadKey", thread_key)
        .order_by("createdAt", Direction::Ascending)
}

/// Append `text` to `thread_key` as the session's role.
pub async fn send_message(
    store: &dyn DocumentStore,
    session: &Session,
    thread_key: &str,
    text: &str,
) -> Result<ChatMessage, SafelineError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ValidationError::EmptyMessage.into());
    }
    let thread_key = thread_key.trim();
    if thread_key.is_empty() {
        return Err(ValidationError::MissingField("threadKey").into());
    }

    let message = ChatMessage {
        id: String::new(),
        text: text.to_string(),
        sender_role: session.role,
        thread_key: thread_key.to_string(),
        created_at: Utc::now(),
    };
    let stored = store.add_record(&message).await?;
    debug!(thread = thread_key, id = %stored.id, "Chat message sent");
    Ok(stored)
}
