//! Message service: durable inter-agent and agent-operator messaging.

use sqlx::SqlitePool;

use caw_db::models::{
    AgentStatus, Message, MessagePriority, MessageStatus, MessageType,
};
use caw_db::queries::agents as agent_db;
use caw_db::queries::messages as message_db;

use crate::error::{ErrorCode, ToolError, ToolResult};

/// A message body may arrive as a plain string or a JSON object. Object
/// bodies are serialised once to canonical JSON text and stored; readers
/// get the stored string untouched.
pub fn normalize_body(body: &serde_json::Value) -> ToolResult<String> {
    match body {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Null => Err(ToolError::new(
            ErrorCode::InvalidInput,
            "message body must not be null",
        )),
        other => serde_json::to_string(other).map_err(ToolError::internal),
    }
}

/// Inputs for [`send`].
#[derive(Debug, Clone)]
pub struct SendMessage<'a> {
    pub sender_id: &'a str,
    pub recipient_id: &'a str,
    pub message_type: MessageType,
    pub subject: &'a str,
    pub body: &'a serde_json::Value,
    pub priority: MessagePriority,
    pub workflow_id: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub reply_to_id: Option<&'a str>,
}

/// Send a message from one registered agent to another.
pub async fn send(pool: &SqlitePool, input: &SendMessage<'_>) -> ToolResult<Message> {
    if agent_db::get_agent(pool, input.sender_id).await?.is_none() {
        return Err(ToolError::new(
            ErrorCode::SenderNotFound,
            format!("sender {} is not a registered agent", input.sender_id),
        ));
    }
    if agent_db::get_agent(pool, input.recipient_id).await?.is_none() {
        return Err(ToolError::new(
            ErrorCode::RecipientNotFound,
            format!("recipient {} is not a registered agent", input.recipient_id),
        ));
    }

    let body = normalize_body(input.body)?;

    Ok(message_db::insert_message(
        pool,
        &message_db::NewMessage {
            sender_id: input.sender_id,
            recipient_id: input.recipient_id,
            message_type: input.message_type,
            subject: input.subject,
            body: &body,
            priority: input.priority,
            workflow_id: input.workflow_id,
            task_id: input.task_id,
            reply_to_id: input.reply_to_id,
        },
    )
    .await?)
}

/// Send the same message to every online agent except the sender. Returns
/// the created messages.
pub async fn broadcast(
    pool: &SqlitePool,
    sender_id: &str,
    subject: &str,
    body: &serde_json::Value,
    priority: MessagePriority,
    workflow_id: Option<&str>,
) -> ToolResult<Vec<Message>> {
    if agent_db::get_agent(pool, sender_id).await?.is_none() {
        return Err(ToolError::new(
            ErrorCode::SenderNotFound,
            format!("sender {sender_id} is not a registered agent"),
        ));
    }

    let body = normalize_body(body)?;
    let recipients = agent_db::list_agents(pool, workflow_id, Some(AgentStatus::Online)).await?;

    let mut sent = Vec::new();
    for recipient in recipients.iter().filter(|a| a.id != sender_id) {
        let message = message_db::insert_message(
            pool,
            &message_db::NewMessage {
                sender_id,
                recipient_id: &recipient.id,
                message_type: MessageType::Broadcast,
                subject,
                body: &body,
                priority,
                workflow_id,
                task_id: None,
                reply_to_id: None,
            },
        )
        .await?;
        sent.push(message);
    }

    Ok(sent)
}

/// Fetch a message, optionally marking it read.
pub async fn get(pool: &SqlitePool, id: &str, mark_read: bool) -> ToolResult<Message> {
    let message = message_db::get_message(pool, id)
        .await?
        .ok_or_else(|| ToolError::new(ErrorCode::MessageNotFound, format!("message {id} not found")))?;

    if mark_read && message.status == MessageStatus::Unread {
        message_db::mark_read(pool, id).await?;
        return Ok(message_db::get_message(pool, id).await?.unwrap_or(message));
    }

    Ok(message)
}

/// List an agent's messages (delivery order).
pub async fn list(
    pool: &SqlitePool,
    agent_id: &str,
    filter: &message_db::MessageFilter,
) -> ToolResult<Vec<Message>> {
    Ok(message_db::list_messages(pool, agent_id, filter).await?)
}

/// Mark a message read.
pub async fn mark_read(pool: &SqlitePool, id: &str) -> ToolResult<()> {
    if message_db::get_message(pool, id).await?.is_none() {
        return Err(ToolError::new(ErrorCode::MessageNotFound, format!("message {id} not found")));
    }
    message_db::mark_read(pool, id).await?;
    Ok(())
}

/// Archive a message.
pub async fn archive(pool: &SqlitePool, id: &str) -> ToolResult<()> {
    let rows = message_db::archive(pool, id).await?;
    if rows == 0 {
        return Err(ToolError::new(ErrorCode::MessageNotFound, format!("message {id} not found")));
    }
    Ok(())
}

/// Count unread messages for an agent.
pub async fn count_unread(
    pool: &SqlitePool,
    agent_id: &str,
    priorities: Option<&[MessagePriority]>,
) -> ToolResult<i64> {
    Ok(message_db::count_unread(pool, agent_id, priorities).await?)
}
