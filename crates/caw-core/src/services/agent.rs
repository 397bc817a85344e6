//! Agent service: registration, heartbeats, and teardown.

use sqlx::SqlitePool;
use tracing::info;

use caw_db::models::{Agent, AgentRole, AgentRuntime, AgentStatus};
use caw_db::queries::agents as agent_db;
use caw_db::queries::tasks as task_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::require_agent;

/// Inputs for [`register`].
#[derive(Debug, Clone)]
pub struct RegisterAgent<'a> {
    pub name: &'a str,
    pub runtime: AgentRuntime,
    pub role: AgentRole,
    pub capabilities: Option<&'a [String]>,
    pub workflow_id: Option<&'a str>,
    pub workspace_path: Option<&'a str>,
    pub metadata: Option<&'a serde_json::Value>,
}

/// Register a new agent in `online` status.
pub async fn register(pool: &SqlitePool, input: &RegisterAgent<'_>) -> ToolResult<Agent> {
    if input.name.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::InvalidInput, "agent name must not be empty"));
    }
    if let Some(workflow_id) = input.workflow_id {
        crate::services::require_workflow(pool, workflow_id).await?;
    }

    let capabilities = match input.capabilities {
        Some(caps) => Some(serde_json::to_string(caps).map_err(ToolError::internal)?),
        None => None,
    };
    let metadata = match input.metadata {
        Some(meta) => Some(serde_json::to_string(meta).map_err(ToolError::internal)?),
        None => None,
    };

    let agent = agent_db::insert_agent(
        pool,
        &agent_db::NewAgent {
            name: input.name,
            runtime: input.runtime,
            role: input.role,
            capabilities: capabilities.as_deref(),
            workflow_id: input.workflow_id,
            workspace_path: input.workspace_path,
            metadata: metadata.as_deref(),
        },
    )
    .await?;

    info!(agent_id = %agent.id, name = %agent.name, runtime = %agent.runtime, "agent registered");
    Ok(agent)
}

/// Record a heartbeat.
pub async fn heartbeat(pool: &SqlitePool, agent_id: &str) -> ToolResult<()> {
    let rows = agent_db::heartbeat(pool, agent_id).await?;
    if rows == 0 {
        return Err(ToolError::new(
            ErrorCode::AgentNotFound,
            format!("agent {agent_id} not found"),
        ));
    }
    Ok(())
}

/// Apply a partial update to an agent row.
pub async fn update(
    pool: &SqlitePool,
    agent_id: &str,
    update: &agent_db::AgentUpdate<'_>,
) -> ToolResult<Agent> {
    require_agent(pool, agent_id).await?;
    agent_db::update_agent(pool, agent_id, update).await?;
    require_agent(pool, agent_id).await
}

/// Fetch an agent by id.
pub async fn get(pool: &SqlitePool, agent_id: &str) -> ToolResult<Agent> {
    require_agent(pool, agent_id).await
}

/// List agents, optionally filtered by workflow and status.
pub async fn list(
    pool: &SqlitePool,
    workflow_id: Option<&str>,
    status: Option<AgentStatus>,
) -> ToolResult<Vec<Agent>> {
    Ok(agent_db::list_agents(pool, workflow_id, status).await?)
}

/// Unregister an agent: release every claim it still holds and mark it
/// offline. The row is kept for audit.
pub async fn unregister(pool: &SqlitePool, agent_id: &str) -> ToolResult<u64> {
    require_agent(pool, agent_id).await?;
    let released = task_db::release_tasks_for_agent(pool, agent_id).await?;
    agent_db::set_offline(pool, agent_id).await?;
    info!(agent_id, released, "agent unregistered");
    Ok(released)
}

/// Agents whose heartbeat is older than the threshold.
pub async fn get_stale(pool: &SqlitePool, age_threshold_ms: i64) -> ToolResult<Vec<Agent>> {
    Ok(agent_db::get_stale(pool, age_threshold_ms).await?)
}
