//! Query functions for the `sessions` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Session;
use crate::{ids, now_ms};

/// Register a new session for a client process.
pub async fn insert_session(pool: &SqlitePool, pid: i64, is_daemon: bool) -> Result<Session> {
    let id = ids::generate(ids::prefix::SESSION);
    let now = now_ms();

    let session = sqlx::query_as::<_, Session>(
        "INSERT INTO sessions (id, pid, is_daemon, last_heartbeat, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(pid)
    .bind(is_daemon)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert session")?;

    Ok(session)
}

/// Fetch a single session by id.
pub async fn get_session(pool: &SqlitePool, id: &str) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>("SELECT * FROM sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch session")?;

    Ok(session)
}

/// Record a heartbeat. Returns rows-affected.
pub async fn heartbeat(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE sessions SET last_heartbeat = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to heartbeat session")?;

    Ok(result.rows_affected())
}

/// Delete a session row. Returns rows-affected.
pub async fn delete_session(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete session")?;

    Ok(result.rows_affected())
}

/// Promote a session to daemon. Returns rows-affected.
pub async fn promote_to_daemon(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE sessions SET is_daemon = 1, last_heartbeat = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to promote session to daemon")?;

    Ok(result.rows_affected())
}

/// The current daemon session, if one is registered.
pub async fn get_daemon_session(pool: &SqlitePool) -> Result<Option<Session>> {
    let session = sqlx::query_as::<_, Session>(
        "SELECT * FROM sessions WHERE is_daemon = 1 ORDER BY created_at DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await
    .context("failed to fetch daemon session")?;

    Ok(session)
}

/// Delete sessions whose heartbeat is older than `max_age_ms`. Returns
/// rows-affected.
pub async fn cleanup_stale(pool: &SqlitePool, max_age_ms: i64) -> Result<u64> {
    let cutoff = now_ms() - max_age_ms;
    let result = sqlx::query("DELETE FROM sessions WHERE last_heartbeat < ?")
        .bind(cutoff)
        .execute(pool)
        .await
        .context("failed to clean up stale sessions")?;

    Ok(result.rows_affected())
}
