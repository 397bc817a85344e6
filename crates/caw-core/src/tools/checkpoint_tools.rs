//! `checkpoint_*` tools.

use serde::Deserialize;

use caw_db::models::CheckpointType;

use crate::services::checkpoint;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct AddArgs {
    task_id: String,
    #[serde(rename = "type")]
    checkpoint_type: CheckpointType,
    summary: String,
    #[serde(default)]
    detail: Option<String>,
    #[serde(default)]
    files: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct ListArgs {
    task_id: String,
    #[serde(default)]
    types: Option<Vec<CheckpointType>>,
    #[serde(default)]
    since_sequence: Option<i64>,
    #[serde(default)]
    limit: Option<i64>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "checkpoint_add",
        "Append a progress record to a task's log",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AddArgs = parse_args(args)?;
                let created = checkpoint::add(
                    &ctx.db,
                    &input.task_id,
                    input.checkpoint_type,
                    &input.summary,
                    input.detail.as_deref(),
                    input.files.as_deref(),
                )
                .await?;
                to_value(&created)
            })
        }),
    );

    registry.add(
        "checkpoint_list",
        "A task's checkpoints in sequence order",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ListArgs = parse_args(args)?;
                let checkpoints = checkpoint::list(
                    &ctx.db,
                    &input.task_id,
                    input.types,
                    input.since_sequence,
                    input.limit,
                )
                .await?;
                to_value(&checkpoints)
            })
        }),
    );
}
