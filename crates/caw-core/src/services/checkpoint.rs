//! Checkpoint service: append-only per-task progress records.

use sqlx::SqlitePool;

use caw_db::models::{Checkpoint, CheckpointType};
use caw_db::queries::checkpoints as checkpoint_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::require_task;

/// Append a checkpoint to a task's log.
pub async fn add(
    pool: &SqlitePool,
    task_id: &str,
    checkpoint_type: CheckpointType,
    summary: &str,
    detail: Option<&str>,
    files: Option<&[String]>,
) -> ToolResult<Checkpoint> {
    require_task(pool, task_id).await?;
    if summary.trim().is_empty() {
        return Err(ToolError::new(
            ErrorCode::InvalidInput,
            "checkpoint summary must not be empty",
        ));
    }

    let files_json = match files {
        Some(files) => Some(serde_json::to_string(files).map_err(ToolError::internal)?),
        None => None,
    };

    Ok(checkpoint_db::insert_checkpoint(
        pool,
        task_id,
        checkpoint_type,
        summary,
        detail,
        files_json.as_deref(),
    )
    .await?)
}

/// List a task's checkpoints in sequence order.
pub async fn list(
    pool: &SqlitePool,
    task_id: &str,
    types: Option<Vec<CheckpointType>>,
    since_sequence: Option<i64>,
    limit: Option<i64>,
) -> ToolResult<Vec<Checkpoint>> {
    require_task(pool, task_id).await?;
    Ok(checkpoint_db::list_checkpoints(
        pool,
        task_id,
        &checkpoint_db::CheckpointFilter {
            types,
            since_sequence,
            limit,
        },
    )
    .await?)
}
