//! Session service: client process identities.

use sqlx::SqlitePool;

use caw_db::models::Session;
use caw_db::queries::sessions as session_db;

use crate::error::{ErrorCode, ToolError, ToolResult};

/// Register a session for the calling process.
pub async fn register(pool: &SqlitePool, pid: i64, is_daemon: bool) -> ToolResult<Session> {
    Ok(session_db::insert_session(pool, pid, is_daemon).await?)
}

/// Record a heartbeat.
pub async fn heartbeat(pool: &SqlitePool, session_id: &str) -> ToolResult<()> {
    let rows = session_db::heartbeat(pool, session_id).await?;
    if rows == 0 {
        return Err(ToolError::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        ));
    }
    Ok(())
}

/// Remove a session; its workflow locks cascade away.
pub async fn deregister(pool: &SqlitePool, session_id: &str) -> ToolResult<()> {
    session_db::delete_session(pool, session_id).await?;
    Ok(())
}

/// Promote a client session to daemon.
pub async fn promote_to_daemon(pool: &SqlitePool, session_id: &str) -> ToolResult<()> {
    let rows = session_db::promote_to_daemon(pool, session_id).await?;
    if rows == 0 {
        return Err(ToolError::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        ));
    }
    Ok(())
}

/// Fetch a session by id.
pub async fn get(pool: &SqlitePool, session_id: &str) -> ToolResult<Session> {
    session_db::get_session(pool, session_id).await?.ok_or_else(|| {
        ToolError::new(
            ErrorCode::SessionNotFound,
            format!("session {session_id} not found"),
        )
    })
}

/// Delete sessions silent for longer than `max_age_ms`.
pub async fn cleanup_stale(pool: &SqlitePool, max_age_ms: i64) -> ToolResult<u64> {
    Ok(session_db::cleanup_stale(pool, max_age_ms).await?)
}
