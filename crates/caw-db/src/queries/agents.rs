//! Query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Agent, AgentRole, AgentRuntime, AgentStatus};
use crate::{ids, now_ms};

/// Fields for a new agent row.
#[derive(Debug, Clone)]
pub struct NewAgent<'a> {
    pub name: &'a str,
    pub runtime: AgentRuntime,
    pub role: AgentRole,
    pub capabilities: Option<&'a str>,
    pub workflow_id: Option<&'a str>,
    pub workspace_path: Option<&'a str>,
    pub metadata: Option<&'a str>,
}

/// Insert a new agent in `online` status with a fresh heartbeat.
pub async fn insert_agent(pool: &SqlitePool, new: &NewAgent<'_>) -> Result<Agent> {
    let id = ids::generate(ids::prefix::AGENT);
    let now = now_ms();

    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents \
         (id, name, runtime, role, status, capabilities, workflow_id, workspace_path, \
          last_heartbeat, metadata, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'online', ?, ?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(new.name)
    .bind(new.runtime)
    .bind(new.role)
    .bind(new.capabilities)
    .bind(new.workflow_id)
    .bind(new.workspace_path)
    .bind(now)
    .bind(new.metadata)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert agent")?;

    Ok(agent)
}

/// Fetch a single agent by id.
pub async fn get_agent(pool: &SqlitePool, id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// List agents, optionally filtered by workflow and/or status.
pub async fn list_agents(
    pool: &SqlitePool,
    workflow_id: Option<&str>,
    status: Option<AgentStatus>,
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE (? IS NULL OR workflow_id = ?) \
           AND (? IS NULL OR status = ?) \
         ORDER BY created_at ASC",
    )
    .bind(workflow_id)
    .bind(workflow_id)
    .bind(status)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list agents")?;

    Ok(agents)
}

/// Record a heartbeat. Returns rows-affected.
pub async fn heartbeat(pool: &SqlitePool, id: &str) -> Result<u64> {
    let now = now_ms();
    let result = sqlx::query("UPDATE agents SET last_heartbeat = ?, updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to heartbeat agent")?;

    Ok(result.rows_affected())
}

/// Mutable agent fields for [`update_agent`]. `None` leaves a field as-is.
#[derive(Debug, Clone, Default)]
pub struct AgentUpdate<'a> {
    pub status: Option<AgentStatus>,
    pub current_task_id: Option<Option<&'a str>>,
    pub workspace_path: Option<&'a str>,
    pub metadata: Option<&'a str>,
}

/// Apply a partial update. Returns rows-affected.
pub async fn update_agent(pool: &SqlitePool, id: &str, update: &AgentUpdate<'_>) -> Result<u64> {
    // current_task_id distinguishes "leave alone" (outer None) from
    // "clear" (Some(None)); the flag column drives the CASE.
    let set_task = update.current_task_id.is_some();
    let task_value = update.current_task_id.flatten();

    let result = sqlx::query(
        "UPDATE agents SET \
             status = COALESCE(?, status), \
             current_task_id = CASE WHEN ? THEN ? ELSE current_task_id END, \
             workspace_path = COALESCE(?, workspace_path), \
             metadata = COALESCE(?, metadata), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(update.status)
    .bind(set_task)
    .bind(task_value)
    .bind(update.workspace_path)
    .bind(update.metadata)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update agent")?;

    Ok(result.rows_affected())
}

/// Mark an agent offline and clear its current task. Returns rows-affected.
pub async fn set_offline(pool: &SqlitePool, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents SET status = 'offline', current_task_id = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set agent offline")?;

    Ok(result.rows_affected())
}

/// Agents whose last heartbeat is older than `age_threshold_ms` and that
/// are not already offline.
pub async fn get_stale(pool: &SqlitePool, age_threshold_ms: i64) -> Result<Vec<Agent>> {
    let cutoff = now_ms() - age_threshold_ms;
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE status != 'offline' AND last_heartbeat < ?",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stale agents")?;

    Ok(agents)
}

/// Fetch the pseudo-agent registered for operator Q&A, if any.
pub async fn get_human_agent(pool: &SqlitePool, workflow_id: &str) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE workflow_id = ? AND runtime = 'human' \
         ORDER BY created_at ASC LIMIT 1",
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch human agent")?;

    Ok(agent)
}
