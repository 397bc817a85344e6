//! Query functions for the `messages` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Message, MessagePriority, MessageStatus, MessageType};
use crate::{ids, now_ms};

/// Fields for a new message row.
#[derive(Debug, Clone)]
pub struct NewMessage<'a> {
    pub sender_id: &'a str,
    pub recipient_id: &'a str,
    pub message_type: MessageType,
    pub subject: &'a str,
    pub body: &'a str,
    pub priority: MessagePriority,
    pub workflow_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub reply_to_id: Option<&'a str>,
}

/// Insert a message in `unread` status.
pub async fn insert_message(pool: &SqlitePool, new: &NewMessage<'_>) -> Result<Message> {
    let id = ids::generate(ids::prefix::MESSAGE);

    let message = sqlx::query_as::<_, Message>(
        "INSERT INTO messages \
         (id, sender_id, recipient_id, message_type, subject, body, priority, status, \
          workflow_id, task_id, reply_to_id, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 'unread', ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(new.sender_id)
    .bind(new.recipient_id)
    .bind(new.message_type)
    .bind(new.subject)
    .bind(new.body)
    .bind(new.priority)
    .bind(new.workflow_id)
    .bind(new.task_id)
    .bind(new.reply_to_id)
    .bind(now_ms())
    .fetch_one(pool)
    .await
    .context("failed to insert message")?;

    Ok(message)
}

/// Fetch a single message by id.
pub async fn get_message(pool: &SqlitePool, id: &str) -> Result<Option<Message>> {
    let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch message")?;

    Ok(message)
}

/// Filter for [`list_messages`].
#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<MessageStatus>,
    pub message_type: Option<MessageType>,
    pub workflow_id: Option<String>,
    pub task_id: Option<String>,
    pub limit: Option<i64>,
}

/// List a recipient's messages, oldest first (delivery order).
pub async fn list_messages(
    pool: &SqlitePool,
    recipient_id: &str,
    filter: &MessageFilter,
) -> Result<Vec<Message>> {
    let limit = filter.limit.unwrap_or(i64::MAX);

    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages \
         WHERE recipient_id = ? \
           AND (? IS NULL OR status = ?) \
           AND (? IS NULL OR message_type = ?) \
           AND (? IS NULL OR workflow_id = ?) \
           AND (? IS NULL OR task_id = ?) \
         ORDER BY created_at ASC \
         LIMIT ?",
    )
    .bind(recipient_id)
    .bind(filter.status)
    .bind(filter.status)
    .bind(filter.message_type)
    .bind(filter.message_type)
    .bind(filter.workflow_id.as_deref())
    .bind(filter.workflow_id.as_deref())
    .bind(filter.task_id.as_deref())
    .bind(filter.task_id.as_deref())
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list messages")?;

    Ok(messages)
}

/// Every message tagged with a task, oldest first. Used to rebuild the
/// Q&A history in a fresh agent's system prompt.
pub async fn list_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages WHERE task_id = ? ORDER BY created_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list task messages")?;

    Ok(messages)
}

/// Unread messages of one type tagged with a task, regardless of
/// recipient. The spawner's poll loop uses this to find operator answers
/// for paused tasks.
pub async fn list_unread_for_task(
    pool: &SqlitePool,
    task_id: &str,
    message_type: MessageType,
) -> Result<Vec<Message>> {
    let messages = sqlx::query_as::<_, Message>(
        "SELECT * FROM messages \
         WHERE task_id = ? AND message_type = ? AND status = 'unread' \
         ORDER BY created_at ASC",
    )
    .bind(task_id)
    .bind(message_type)
    .fetch_all(pool)
    .await
    .context("failed to list unread task messages")?;

    Ok(messages)
}

/// Mark a message `read`. Returns rows-affected.
pub async fn mark_read(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE messages SET status = 'read' WHERE id = ? AND status = 'unread'")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to mark message read")?;

    Ok(result.rows_affected())
}

/// Archive a message. Returns rows-affected.
pub async fn archive(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE messages SET status = 'archived' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to archive message")?;

    Ok(result.rows_affected())
}

/// Count unread messages for a recipient, optionally restricted to a set
/// of priorities.
pub async fn count_unread(
    pool: &SqlitePool,
    recipient_id: &str,
    priorities: Option<&[MessagePriority]>,
) -> Result<i64> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT priority, COUNT(*) FROM messages \
         WHERE recipient_id = ? AND status = 'unread' \
         GROUP BY priority",
    )
    .bind(recipient_id)
    .fetch_all(pool)
    .await
    .context("failed to count unread messages")?;

    let total = rows
        .iter()
        .filter(|(priority, _)| match priorities {
            Some(wanted) => wanted.iter().any(|p| p.to_string() == *priority),
            None => true,
        })
        .map(|(_, count)| count)
        .sum();

    Ok(total)
}
