//! Query functions for the `checkpoints` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Checkpoint, CheckpointType};
use crate::{ids, now_ms};

/// Append a checkpoint, allocating the next per-task sequence atomically.
///
/// The sequence subquery and the insert run as one statement, so the store's
/// single writer guarantees strict monotonicity without a separate counter.
pub async fn insert_checkpoint(
    pool: &SqlitePool,
    task_id: &str,
    checkpoint_type: CheckpointType,
    summary: &str,
    detail: Option<&str>,
    files: Option<&str>,
) -> Result<Checkpoint> {
    let id = ids::generate(ids::prefix::CHECKPOINT);

    let checkpoint = sqlx::query_as::<_, Checkpoint>(
        "INSERT INTO checkpoints (id, task_id, sequence, checkpoint_type, summary, detail, files, created_at) \
         SELECT ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?, ? \
         FROM checkpoints WHERE task_id = ? \
         RETURNING *",
    )
    .bind(&id)
    .bind(task_id)
    .bind(checkpoint_type)
    .bind(summary)
    .bind(detail)
    .bind(files)
    .bind(now_ms())
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to insert checkpoint")?;

    Ok(checkpoint)
}

/// Filter for [`list_checkpoints`].
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub types: Option<Vec<CheckpointType>>,
    pub since_sequence: Option<i64>,
    pub limit: Option<i64>,
}

/// List a task's checkpoints in sequence order, with optional filters.
pub async fn list_checkpoints(
    pool: &SqlitePool,
    task_id: &str,
    filter: &CheckpointFilter,
) -> Result<Vec<Checkpoint>> {
    let since = filter.since_sequence.unwrap_or(0);
    let limit = filter.limit.unwrap_or(i64::MAX);

    let checkpoints = sqlx::query_as::<_, Checkpoint>(
        "SELECT * FROM checkpoints \
         WHERE task_id = ? AND sequence > ? \
         ORDER BY sequence ASC \
         LIMIT ?",
    )
    .bind(task_id)
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list checkpoints")?;

    // Type filtering happens in-process; the type list is small and this
    // keeps the SQL static.
    let checkpoints = match &filter.types {
        Some(types) => checkpoints
            .into_iter()
            .filter(|c| types.contains(&c.checkpoint_type))
            .collect(),
        None => checkpoints,
    };

    Ok(checkpoints)
}
