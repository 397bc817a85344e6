//! Workflow lock service: at most one writing session per workflow.

use serde::Serialize;
use sqlx::SqlitePool;

use caw_db::models::WorkflowLock;
use caw_db::queries::{locks as lock_db, sessions as session_db};
use caw_db::now_ms;

use crate::error::{ErrorCode, ToolError, ToolResult};

/// Sessions silent for longer than this are treated as dead.
pub const STALE_SESSION_MS: i64 = 60_000;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Serialize)]
pub struct LockResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_by: Option<String>,
}

/// Acquire (or refresh) the write lock for a session. A lock held by a dead
/// session is broken on the spot.
pub async fn lock(pool: &SqlitePool, workflow_id: &str, session_id: &str) -> ToolResult<LockResult> {
    crate::services::require_workflow(pool, workflow_id).await?;
    if session_db::get_session(pool, session_id).await?.is_none() {
        return Err(ToolError::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        ));
    }

    let rows = lock_db::try_lock(pool, workflow_id, session_id).await?;
    if rows > 0 {
        return Ok(LockResult {
            success: true,
            locked_by: None,
        });
    }

    // Conflict: see whether the holder is still alive.
    match lock_db::get_lock(pool, workflow_id).await? {
        Some(existing) if holder_is_live(pool, &existing).await? => Ok(LockResult {
            success: false,
            locked_by: Some(existing.session_id),
        }),
        Some(_) => {
            // Dead holder: break the lock and take it.
            lock_db::force_unlock(pool, workflow_id).await?;
            let rows = lock_db::try_lock(pool, workflow_id, session_id).await?;
            if rows > 0 {
                Ok(LockResult {
                    success: true,
                    locked_by: None,
                })
            } else {
                // Someone else won the re-acquire race.
                let holder = lock_db::get_lock(pool, workflow_id).await?.map(|l| l.session_id);
                Ok(LockResult {
                    success: false,
                    locked_by: holder,
                })
            }
        }
        None => {
            // Row vanished between upsert and read; retry once.
            let rows = lock_db::try_lock(pool, workflow_id, session_id).await?;
            Ok(LockResult {
                success: rows > 0,
                locked_by: None,
            })
        }
    }
}

async fn holder_is_live(pool: &SqlitePool, lock: &WorkflowLock) -> ToolResult<bool> {
    let session = session_db::get_session(pool, &lock.session_id).await?;
    Ok(match session {
        Some(s) => now_ms() - s.last_heartbeat < STALE_SESSION_MS,
        None => false,
    })
}

/// Release a lock held by this session.
pub async fn unlock(pool: &SqlitePool, workflow_id: &str, session_id: &str) -> ToolResult<LockResult> {
    crate::services::require_workflow(pool, workflow_id).await?;
    let rows = lock_db::unlock(pool, workflow_id, session_id).await?;
    if rows > 0 {
        Ok(LockResult {
            success: true,
            locked_by: None,
        })
    } else {
        let holder = lock_db::get_lock(pool, workflow_id).await?.map(|l| l.session_id);
        Ok(LockResult {
            success: false,
            locked_by: holder,
        })
    }
}

/// Whether another live session holds the lock.
pub async fn is_locked_by_other(
    pool: &SqlitePool,
    workflow_id: &str,
    session_id: &str,
) -> ToolResult<bool> {
    match lock_db::get_lock(pool, workflow_id).await? {
        Some(lock) if lock.session_id != session_id => holder_is_live(pool, &lock).await,
        _ => Ok(false),
    }
}

/// The current lock row, if any.
pub async fn get_lock_info(pool: &SqlitePool, workflow_id: &str) -> ToolResult<Option<WorkflowLock>> {
    crate::services::require_workflow(pool, workflow_id).await?;
    Ok(lock_db::get_lock(pool, workflow_id).await?)
}

/// Drop locks whose holding session has gone silent.
pub async fn release_stale_workflow_locks(pool: &SqlitePool, max_age_ms: i64) -> ToolResult<u64> {
    Ok(lock_db::release_stale(pool, max_age_ms).await?)
}

/// The guard run before plan-mutating tools: when the caller presents a
/// session id and another live session holds the lock, the mutation is
/// rejected. Calls without a session id bypass the guard (back-compat).
pub async fn guard(
    pool: &SqlitePool,
    workflow_id: &str,
    session_id: Option<&str>,
) -> ToolResult<()> {
    let Some(session_id) = session_id else {
        return Ok(());
    };
    if is_locked_by_other(pool, workflow_id, session_id).await? {
        let holder = lock_db::get_lock(pool, workflow_id).await?.map(|l| l.session_id);
        return Err(ToolError::new(
            ErrorCode::WorkflowLocked,
            format!(
                "workflow {workflow_id} is locked by session {}",
                holder.unwrap_or_else(|| "unknown".to_string())
            ),
        ));
    }
    Ok(())
}
