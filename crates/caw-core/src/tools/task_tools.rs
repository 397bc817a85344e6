//! `task_*` tools: status transitions, claim/release, plans, context,
//! and workspace binding.

use serde::Deserialize;

use caw_db::models::TaskStatus;

use crate::services::{lock, task};
use crate::services::task::StatusExtras;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct TaskId {
    task_id: String,
}

#[derive(Deserialize)]
struct UpdateStatusArgs {
    task_id: String,
    status: TaskStatus,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SetPlanArgs {
    task_id: String,
    plan: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct ReplanArgs {
    task_id: String,
    plan: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct ClaimArgs {
    task_id: String,
    agent_id: String,
}

#[derive(Deserialize)]
struct GetAvailableArgs {
    workflow_id: String,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    10
}

#[derive(Deserialize)]
struct AssignWorkspaceArgs {
    task_id: String,
    workspace_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "task_get",
        "Fetch a task by id",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: TaskId = parse_args(args)?;
                let found = task::get(&ctx.db, &input.task_id).await?;
                to_value(&found)
            })
        }),
    );

    registry.add(
        "task_set_plan",
        "Store a task's serialized plan",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: SetPlanArgs = parse_args(args)?;
                let found = task::get(&ctx.db, &input.task_id).await?;
                lock::guard(&ctx.db, &found.workflow_id, input.session_id.as_deref()).await?;
                task::set_plan(&ctx.db, &input.task_id, &input.plan).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "task_update_status",
        "Transition a task's status (outcome/error where required)",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: UpdateStatusArgs = parse_args(args)?;
                let found = task::get(&ctx.db, &input.task_id).await?;
                lock::guard(&ctx.db, &found.workflow_id, input.session_id.as_deref()).await?;
                let updated = task::update_status(
                    &ctx.db,
                    &input.task_id,
                    input.status,
                    &StatusExtras {
                        outcome: input.outcome.as_deref(),
                        error: input.error.as_deref(),
                    },
                )
                .await?;
                to_value(&updated)
            })
        }),
    );

    registry.add(
        "task_replan",
        "Replace a failed or in-flight task's plan",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ReplanArgs = parse_args(args)?;
                let found = task::get(&ctx.db, &input.task_id).await?;
                lock::guard(&ctx.db, &found.workflow_id, input.session_id.as_deref()).await?;
                task::replan(&ctx.db, &input.task_id, &input.plan, input.reason.as_deref()).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "task_claim",
        "Claim a task for an agent (at most one wins)",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ClaimArgs = parse_args(args)?;
                let result = task::claim(&ctx.db, &input.task_id, &input.agent_id).await?;
                to_value(&result)
            })
        }),
    );

    registry.add(
        "task_release",
        "Release a claim held by an agent",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ClaimArgs = parse_args(args)?;
                task::release(&ctx.db, &input.task_id, &input.agent_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "task_get_available",
        "Unblocked, unassigned tasks for a workflow",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: GetAvailableArgs = parse_args(args)?;
                let tasks = task::get_available(&ctx.db, &input.workflow_id, input.limit).await?;
                to_value(&tasks)
            })
        }),
    );

    registry.add(
        "task_check_dependencies",
        "Which dependencies of a task are still unmet",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: TaskId = parse_args(args)?;
                let check = task::check_dependencies(&ctx.db, &input.task_id).await?;
                to_value(&check)
            })
        }),
    );

    registry.add(
        "task_load_context",
        "Context blob, dependency outcomes, and the context chain",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: TaskId = parse_args(args)?;
                task::load_context(&ctx.db, &input.task_id).await
            })
        }),
    );

    registry.add(
        "task_assign_workspace",
        "Bind a workspace to a task (same workflow only)",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AssignWorkspaceArgs = parse_args(args)?;
                let found = task::get(&ctx.db, &input.task_id).await?;
                lock::guard(&ctx.db, &found.workflow_id, input.session_id.as_deref()).await?;
                task::assign_workspace(&ctx.db, &input.task_id, &input.workspace_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );
}
