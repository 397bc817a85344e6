//! Task service: status transitions with guards, the claim/release
//! protocol, plan/context blobs, and scheduling queries.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, info};

use caw_db::models::{CheckpointType, Task, TaskStatus};
use caw_db::queries::agents as agent_db;
use caw_db::queries::checkpoints as checkpoint_db;
use caw_db::queries::tasks as task_db;
use caw_db::queries::workspaces as workspace_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::{require_agent, require_task};
use crate::state::TaskStateMachine;

/// Fetch a task by id.
pub async fn get(pool: &SqlitePool, task_id: &str) -> ToolResult<Task> {
    require_task(pool, task_id).await
}

/// Extra fields accepted by [`update_status`].
#[derive(Debug, Clone, Default)]
pub struct StatusExtras<'a> {
    pub outcome: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Transition a task's status, enforcing the guards of the state machine:
/// entering `planning` needs satisfied dependencies, `completed` needs a
/// non-empty outcome, `failed` needs a non-empty error.
pub async fn update_status(
    pool: &SqlitePool,
    task_id: &str,
    to: TaskStatus,
    extras: &StatusExtras<'_>,
) -> ToolResult<Task> {
    let task = require_task(pool, task_id).await?;
    let from = task.status;

    match to {
        TaskStatus::Completed => {
            let outcome = extras.outcome.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(
                || ToolError::new(ErrorCode::MissingOutcome, "completing a task requires a non-empty outcome"),
            )?;
            if !TaskStateMachine::is_valid_transition(from, to) {
                return Err(ToolError::new(
                    ErrorCode::InvalidTransition,
                    format!("task {task_id} cannot transition {from} -> {to}"),
                ));
            }
            let rows = task_db::complete_task(pool, task_id, outcome).await?;
            if rows == 0 {
                return Err(stale_transition(pool, task_id, from).await);
            }
        }
        TaskStatus::Failed => {
            let error = extras.error.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(
                || ToolError::new(ErrorCode::MissingError, "failing a task requires a non-empty error"),
            )?;
            if !TaskStateMachine::is_valid_transition(from, to) {
                return Err(ToolError::new(
                    ErrorCode::InvalidTransition,
                    format!("task {task_id} cannot transition {from} -> {to}"),
                ));
            }
            let rows = task_db::fail_task(pool, task_id, error).await?;
            if rows == 0 {
                return Err(stale_transition(pool, task_id, from).await);
            }
        }
        TaskStatus::Planning => {
            check_dependencies_met(pool, task_id).await?;
            TaskStateMachine::transition(pool, task_id, from, to).await?;
        }
        _ => {
            TaskStateMachine::transition(pool, task_id, from, to).await?;
        }
    }

    debug!(task_id, %from, %to, "task status updated");
    require_task(pool, task_id).await
}

async fn stale_transition(pool: &SqlitePool, task_id: &str, expected: TaskStatus) -> ToolError {
    match task_db::get_task(pool, task_id).await {
        Ok(Some(t)) => ToolError::new(
            ErrorCode::InvalidTransition,
            format!("task {task_id} has status {}, expected {expected}", t.status),
        ),
        Ok(None) => ToolError::new(ErrorCode::TaskNotFound, format!("task {task_id} not found")),
        Err(e) => ToolError::internal(e),
    }
}

/// Store the serialized plan blob and record a `plan` checkpoint.
pub async fn set_plan(pool: &SqlitePool, task_id: &str, plan: &str) -> ToolResult<()> {
    require_task(pool, task_id).await?;
    task_db::set_plan(pool, task_id, plan).await?;
    checkpoint_db::insert_checkpoint(pool, task_id, CheckpointType::Plan, "plan recorded", Some(plan), None)
        .await?;
    Ok(())
}

/// Replace a task's plan mid-flight. Accepted only when the task is
/// `failed` or `in_progress`.
pub async fn replan(pool: &SqlitePool, task_id: &str, plan: &str, reason: Option<&str>) -> ToolResult<()> {
    let task = require_task(pool, task_id).await?;
    if !matches!(task.status, TaskStatus::Failed | TaskStatus::InProgress) {
        return Err(ToolError::new(
            ErrorCode::InvalidState,
            format!("task {task_id} has status {}, replan needs failed or in_progress", task.status),
        ));
    }
    task_db::set_plan(pool, task_id, plan).await?;
    checkpoint_db::insert_checkpoint(
        pool,
        task_id,
        CheckpointType::Replan,
        reason.unwrap_or("task replanned"),
        Some(plan),
        None,
    )
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Claim protocol
// ---------------------------------------------------------------------------

/// Outcome of a claim attempt. A lost race is data, not an error.
#[derive(Debug, Clone, Serialize)]
pub struct ClaimResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_claimed_by: Option<String>,
}

/// Claim a task for an agent: at most one agent wins.
///
/// A single conditional update is the linearization point; on zero rows the
/// row is re-read to report who holds the claim.
pub async fn claim(pool: &SqlitePool, task_id: &str, agent_id: &str) -> ToolResult<ClaimResult> {
    let task = require_task(pool, task_id).await?;
    require_agent(pool, agent_id).await?;

    if matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked) {
        check_dependencies_met(pool, task_id).await?;
    }

    let rows = task_db::claim_task(pool, task_id, agent_id).await?;
    if rows == 0 {
        let current = require_task(pool, task_id).await?;
        return match current.assigned_agent_id {
            Some(holder) if holder != agent_id => Ok(ClaimResult {
                success: false,
                already_claimed_by: Some(holder),
            }),
            Some(_) => Ok(ClaimResult {
                success: true,
                already_claimed_by: None,
            }),
            None => Err(ToolError::new(
                ErrorCode::InvalidState,
                format!("task {task_id} is not claimable in status {}", current.status),
            )),
        };
    }

    agent_db::update_agent(
        pool,
        agent_id,
        &agent_db::AgentUpdate {
            status: Some(caw_db::models::AgentStatus::Busy),
            current_task_id: Some(Some(task_id)),
            ..Default::default()
        },
    )
    .await?;

    info!(task_id, agent_id, "task claimed");
    Ok(ClaimResult {
        success: true,
        already_claimed_by: None,
    })
}

/// Release a claim. `NOT_CLAIMED` when nobody holds it, `NOT_ASSIGNED` when
/// a different agent does.
pub async fn release(pool: &SqlitePool, task_id: &str, agent_id: &str) -> ToolResult<()> {
    require_task(pool, task_id).await?;

    let rows = task_db::release_task(pool, task_id, agent_id).await?;
    if rows == 0 {
        let current = require_task(pool, task_id).await?;
        return match current.assigned_agent_id {
            None => Err(ToolError::new(
                ErrorCode::NotClaimed,
                format!("task {task_id} is not claimed"),
            )),
            Some(holder) => Err(ToolError::new(
                ErrorCode::NotAssigned,
                format!("task {task_id} is claimed by {holder}, not {agent_id}"),
            )),
        };
    }

    let _ = agent_db::update_agent(
        pool,
        agent_id,
        &agent_db::AgentUpdate {
            status: Some(caw_db::models::AgentStatus::Online),
            current_task_id: Some(None),
            ..Default::default()
        },
    )
    .await;

    info!(task_id, agent_id, "task released");
    Ok(())
}

// ---------------------------------------------------------------------------
// Scheduling / context
// ---------------------------------------------------------------------------

/// Result of a dependency check.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyCheck {
    pub satisfied: bool,
    pub missing: Vec<String>,
}

/// Which of a task's dependencies are not yet terminal.
pub async fn check_dependencies(pool: &SqlitePool, task_id: &str) -> ToolResult<DependencyCheck> {
    require_task(pool, task_id).await?;
    let deps = task_db::get_dependencies(pool, task_id).await?;
    let missing: Vec<String> = deps
        .iter()
        .filter(|d| !d.status.is_terminal())
        .map(|d| d.name.clone())
        .collect();
    Ok(DependencyCheck {
        satisfied: missing.is_empty(),
        missing,
    })
}

/// Fail with `TASK_BLOCKED` when any dependency is unmet.
pub async fn check_dependencies_met(pool: &SqlitePool, task_id: &str) -> ToolResult<()> {
    let check = check_dependencies(pool, task_id).await?;
    if !check.satisfied {
        return Err(ToolError::new(
            ErrorCode::TaskBlocked,
            format!(
                "task {task_id} has unmet dependencies: {}",
                check.missing.join(", ")
            ),
        ));
    }
    Ok(())
}

/// Unblocked, unassigned tasks ready to run.
pub async fn get_available(
    pool: &SqlitePool,
    workflow_id: &str,
    limit: i64,
) -> ToolResult<Vec<Task>> {
    crate::services::require_workflow(pool, workflow_id).await?;
    Ok(task_db::get_available_tasks(pool, workflow_id, true, limit).await?)
}

/// Assemble the context a fresh agent needs: the task's own context blob,
/// outcomes of its dependencies, and the `context_from` chain.
pub async fn load_context(pool: &SqlitePool, task_id: &str) -> ToolResult<serde_json::Value> {
    let task = require_task(pool, task_id).await?;

    let deps = task_db::get_dependencies(pool, task_id).await?;
    let dependency_outcomes: Vec<serde_json::Value> = deps
        .iter()
        .map(|d| {
            serde_json::json!({
                "task": d.name,
                "status": d.status,
                "outcome": d.outcome,
            })
        })
        .collect();

    // Walk the context_from chain; a cycle-proof bound of the workflow's
    // task count stops runaway pointers.
    let mut chain = Vec::new();
    let mut cursor = task.context_from.clone();
    let mut hops = 0;
    while let Some(source_id) = cursor {
        if hops > 64 {
            break;
        }
        hops += 1;
        match task_db::get_task(pool, &source_id).await? {
            Some(source) => {
                chain.push(serde_json::json!({
                    "task": source.name,
                    "context": source.context,
                    "outcome": source.outcome,
                }));
                cursor = source.context_from;
            }
            None => break,
        }
    }

    Ok(serde_json::json!({
        "task_id": task.id,
        "context": task.context,
        "plan": task.plan,
        "dependency_outcomes": dependency_outcomes,
        "context_chain": chain,
    }))
}

/// Bind a workspace to a task. The workspace must belong to the task's
/// workflow.
pub async fn assign_workspace(
    pool: &SqlitePool,
    task_id: &str,
    workspace_id: &str,
) -> ToolResult<()> {
    let task = require_task(pool, task_id).await?;
    let workspace = workspace_db::get_workspace(pool, workspace_id)
        .await?
        .ok_or_else(|| {
            ToolError::new(
                ErrorCode::WorkspaceNotFound,
                format!("workspace {workspace_id} not found"),
            )
        })?;

    if workspace.workflow_id != task.workflow_id {
        return Err(ToolError::new(
            ErrorCode::WorkflowMismatch,
            format!(
                "workspace {workspace_id} belongs to workflow {}, task {task_id} to {}",
                workspace.workflow_id, task.workflow_id
            ),
        ));
    }

    task_db::assign_workspace(pool, task_id, workspace_id, None).await?;
    Ok(())
}
