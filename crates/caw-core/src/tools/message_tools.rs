//! `message_*` tools.

use serde::Deserialize;

use caw_db::models::{MessagePriority, MessageStatus, MessageType};
use caw_db::queries::messages::MessageFilter;

use crate::services::message;
use crate::services::message::SendMessage;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct SendArgs {
    sender_id: String,
    recipient_id: String,
    #[serde(default = "default_type")]
    message_type: MessageType,
    #[serde(default)]
    subject: String,
    /// String or JSON object; objects are stored as canonical JSON text.
    body: serde_json::Value,
    #[serde(default = "default_priority")]
    priority: MessagePriority,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    reply_to_id: Option<String>,
}

fn default_type() -> MessageType {
    MessageType::StatusUpdate
}

fn default_priority() -> MessagePriority {
    MessagePriority::Normal
}

#[derive(Deserialize)]
struct BroadcastArgs {
    sender_id: String,
    #[serde(default)]
    subject: String,
    body: serde_json::Value,
    #[serde(default = "default_priority")]
    priority: MessagePriority,
    #[serde(default)]
    workflow_id: Option<String>,
}

#[derive(Deserialize)]
struct ListArgs {
    agent_id: String,
    #[serde(default)]
    status: Option<MessageStatus>,
    #[serde(default)]
    message_type: Option<MessageType>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct GetArgs {
    message_id: String,
    #[serde(default)]
    mark_read: bool,
}

#[derive(Deserialize)]
struct MessageId {
    message_id: String,
}

#[derive(Deserialize)]
struct CountUnreadArgs {
    agent_id: String,
    #[serde(default)]
    priorities: Option<Vec<MessagePriority>>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "message_send",
        "Send a durable message between agents",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: SendArgs = parse_args(args)?;
                let sent = message::send(
                    &ctx.db,
                    &SendMessage {
                        sender_id: &input.sender_id,
                        recipient_id: &input.recipient_id,
                        message_type: input.message_type,
                        subject: &input.subject,
                        body: &input.body,
                        priority: input.priority,
                        workflow_id: input.workflow_id.as_deref(),
                        task_id: input.task_id.as_deref(),
                        reply_to_id: input.reply_to_id.as_deref(),
                    },
                )
                .await?;
                to_value(&sent)
            })
        }),
    );

    registry.add(
        "message_broadcast",
        "Send to every online agent except the sender",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: BroadcastArgs = parse_args(args)?;
                let sent = message::broadcast(
                    &ctx.db,
                    &input.sender_id,
                    &input.subject,
                    &input.body,
                    input.priority,
                    input.workflow_id.as_deref(),
                )
                .await?;
                Ok(serde_json::json!({
                    "sent": sent.len(),
                    "message_ids": sent.iter().map(|m| m.id.clone()).collect::<Vec<_>>(),
                }))
            })
        }),
    );

    registry.add(
        "message_list",
        "An agent's messages in delivery order",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ListArgs = parse_args(args)?;
                let messages = message::list(
                    &ctx.db,
                    &input.agent_id,
                    &MessageFilter {
                        status: input.status,
                        message_type: input.message_type,
                        workflow_id: input.workflow_id,
                        task_id: input.task_id,
                        limit: input.limit,
                    },
                )
                .await?;
                to_value(&messages)
            })
        }),
    );

    registry.add(
        "message_get",
        "Fetch a message, optionally marking it read",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: GetArgs = parse_args(args)?;
                let found = message::get(&ctx.db, &input.message_id, input.mark_read).await?;
                to_value(&found)
            })
        }),
    );

    registry.add(
        "message_mark_read",
        "Mark a message read",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: MessageId = parse_args(args)?;
                message::mark_read(&ctx.db, &input.message_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "message_archive",
        "Archive a message",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: MessageId = parse_args(args)?;
                message::archive(&ctx.db, &input.message_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "message_count_unread",
        "Unread message count for an agent",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: CountUnreadArgs = parse_args(args)?;
                let count = message::count_unread(
                    &ctx.db,
                    &input.agent_id,
                    input.priorities.as_deref(),
                )
                .await?;
                Ok(serde_json::json!({ "unread": count }))
            })
        }),
    );
}
