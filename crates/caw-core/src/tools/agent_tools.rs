//! `agent_*` tools.

use serde::Deserialize;

use caw_db::models::{AgentRole, AgentRuntime, AgentStatus};
use caw_db::queries::agents as agent_db;

use crate::services::agent;
use crate::services::agent::RegisterAgent;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct RegisterArgs {
    name: String,
    #[serde(default = "default_runtime")]
    runtime: AgentRuntime,
    #[serde(default = "default_role")]
    role: AgentRole,
    #[serde(default)]
    capabilities: Option<Vec<String>>,
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    workspace_path: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

fn default_runtime() -> AgentRuntime {
    AgentRuntime::ClaudeCode
}

fn default_role() -> AgentRole {
    AgentRole::Worker
}

#[derive(Deserialize)]
struct AgentId {
    agent_id: String,
}

#[derive(Deserialize)]
struct UpdateArgs {
    agent_id: String,
    #[serde(default)]
    status: Option<AgentStatus>,
    /// Present-but-null clears the field.
    #[serde(default, with = "double_option")]
    current_task_id: Option<Option<String>>,
    #[serde(default)]
    workspace_path: Option<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Distinguish an absent field from an explicit null.
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    status: Option<AgentStatus>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "agent_register",
        "Register an agent principal",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: RegisterArgs = parse_args(args)?;
                let registered = agent::register(
                    &ctx.db,
                    &RegisterAgent {
                        name: &input.name,
                        runtime: input.runtime,
                        role: input.role,
                        capabilities: input.capabilities.as_deref(),
                        workflow_id: input.workflow_id.as_deref(),
                        workspace_path: input.workspace_path.as_deref(),
                        metadata: input.metadata.as_ref(),
                    },
                )
                .await?;
                to_value(&registered)
            })
        }),
    );

    registry.add(
        "agent_heartbeat",
        "Record an agent heartbeat",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AgentId = parse_args(args)?;
                agent::heartbeat(&ctx.db, &input.agent_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "agent_update",
        "Partial update of an agent row",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: UpdateArgs = parse_args(args)?;
                let metadata = match &input.metadata {
                    Some(meta) => Some(serde_json::to_string(meta).map_err(crate::error::ToolError::internal)?),
                    None => None,
                };
                let updated = agent::update(
                    &ctx.db,
                    &input.agent_id,
                    &agent_db::AgentUpdate {
                        status: input.status,
                        current_task_id: input
                            .current_task_id
                            .as_ref()
                            .map(|inner| inner.as_deref()),
                        workspace_path: input.workspace_path.as_deref(),
                        metadata: metadata.as_deref(),
                    },
                )
                .await?;
                to_value(&updated)
            })
        }),
    );

    registry.add(
        "agent_get",
        "Fetch an agent by id",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AgentId = parse_args(args)?;
                let found = agent::get(&ctx.db, &input.agent_id).await?;
                to_value(&found)
            })
        }),
    );

    registry.add(
        "agent_list",
        "List agents, optionally by workflow and status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ListArgs = parse_args(args)?;
                let agents =
                    agent::list(&ctx.db, input.workflow_id.as_deref(), input.status).await?;
                to_value(&agents)
            })
        }),
    );

    registry.add(
        "agent_unregister",
        "Mark an agent offline and release its claims",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AgentId = parse_args(args)?;
                let released = agent::unregister(&ctx.db, &input.agent_id).await?;
                Ok(serde_json::json!({ "success": true, "released_tasks": released }))
            })
        }),
    );
}
