//! Query functions for the `workflow_locks` table.
//!
//! At most one row per workflow; the insert-or-refresh below is the
//! linearization point of the exclusive-writer protocol.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::WorkflowLock;
use crate::now_ms;

/// Try to acquire (or refresh) the lock for `session_id`.
///
/// The conditional upsert only touches the row when it already belongs to
/// the same session, so a competing holder is never displaced. Returns
/// rows-affected: 1 means this session holds the lock, 0 means another
/// session does.
pub async fn try_lock(pool: &SqlitePool, workflow_id: &str, session_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "INSERT INTO workflow_locks (workflow_id, session_id, locked_at) VALUES (?, ?, ?) \
         ON CONFLICT (workflow_id) DO UPDATE SET locked_at = excluded.locked_at \
         WHERE workflow_locks.session_id = excluded.session_id",
    )
    .bind(workflow_id)
    .bind(session_id)
    .bind(now_ms())
    .execute(pool)
    .await
    .context("failed to acquire workflow lock")?;

    Ok(result.rows_affected())
}

/// Fetch the lock row for a workflow, if any.
pub async fn get_lock(pool: &SqlitePool, workflow_id: &str) -> Result<Option<WorkflowLock>> {
    let lock =
        sqlx::query_as::<_, WorkflowLock>("SELECT * FROM workflow_locks WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch workflow lock")?;

    Ok(lock)
}

/// Release a lock held by `session_id`. Returns rows-affected (0 means the
/// session does not hold the lock).
pub async fn unlock(pool: &SqlitePool, workflow_id: &str, session_id: &str) -> Result<u64> {
    let result =
        sqlx::query("DELETE FROM workflow_locks WHERE workflow_id = ? AND session_id = ?")
            .bind(workflow_id)
            .bind(session_id)
            .execute(pool)
            .await
            .context("failed to release workflow lock")?;

    Ok(result.rows_affected())
}

/// Force-remove the lock row regardless of holder (stale-daemon recovery).
pub async fn force_unlock(pool: &SqlitePool, workflow_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM workflow_locks WHERE workflow_id = ?")
        .bind(workflow_id)
        .execute(pool)
        .await
        .context("failed to force-release workflow lock")?;

    Ok(result.rows_affected())
}

/// Drop locks whose holding session has not heartbeaten within
/// `max_age_ms` (or no longer exists). Returns rows-affected.
pub async fn release_stale(pool: &SqlitePool, max_age_ms: i64) -> Result<u64> {
    let cutoff = now_ms() - max_age_ms;
    let result = sqlx::query(
        "DELETE FROM workflow_locks WHERE session_id NOT IN \
         (SELECT id FROM sessions WHERE last_heartbeat >= ?)",
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("failed to release stale workflow locks")?;

    Ok(result.rows_affected())
}
