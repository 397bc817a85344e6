//! `workflow_*` tools: CRUD, planning, locking, repositories, and the
//! execution surface over the spawner registry.

use std::sync::Arc;

use serde::Deserialize;

use caw_db::models::WorkflowStatus;

use crate::error::{ErrorCode, ToolError};
use crate::orchestration;
use crate::services::{lock, workflow};
use crate::services::workflow::{CreateWorkflow, ReplanInput, TaskSpec};
use crate::spawner::launcher::PermissionMode;
use crate::spawner::runner::{self, RunnerOptions};
use crate::spawner::{SpawnerConfig, WorkflowSpawner};

use super::{ToolContext, ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct WorkflowId {
    workflow_id: String,
}

#[derive(Deserialize)]
struct GetArgs {
    workflow_id: String,
    #[serde(default)]
    include_tasks: bool,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    status: Option<WorkflowStatus>,
}

#[derive(Deserialize)]
struct SetPlanArgs {
    workflow_id: String,
    summary: String,
    tasks: Vec<TaskSpec>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct UpdateStatusArgs {
    workflow_id: String,
    status: WorkflowStatus,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct SetParallelismArgs {
    workflow_id: String,
    max_parallel_tasks: i64,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct GetSummaryArgs {
    workflow_id: String,
    #[serde(default = "default_format")]
    format: String,
}

fn default_format() -> String {
    "text".to_string()
}

#[derive(Deserialize)]
struct LockArgs {
    workflow_id: String,
    session_id: String,
}

#[derive(Deserialize)]
struct RepositoryArgs {
    workflow_id: String,
    repository_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct AddTaskArgs {
    workflow_id: String,
    #[serde(flatten)]
    spec: TaskSpec,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct RemoveTaskArgs {
    task_id: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct ReplanArgs {
    workflow_id: String,
    #[serde(flatten)]
    input: ReplanInput,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct StartArgs {
    workflow_id: String,
    #[serde(default)]
    max_agents: Option<usize>,
    #[serde(default)]
    ephemeral_worktree: bool,
    #[serde(default)]
    bypass_permissions: bool,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct NextTasksArgs {
    workflow_id: String,
    #[serde(default = "default_true")]
    include_failed: bool,
}

fn default_true() -> bool {
    true
}

/// Fetch the active spawner for execution tools.
fn spawner_for(ctx: &Arc<ToolContext>, workflow_id: &str) -> Option<Arc<WorkflowSpawner>> {
    ctx.registry.get(workflow_id)
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "workflow_create",
        "Create a workflow in planning status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: CreateWorkflow = parse_args(args)?;
                let created = workflow::create(&ctx.db, &input).await?;
                to_value(&created)
            })
        }),
    );

    registry.add(
        "workflow_get",
        "Fetch a workflow, optionally with its tasks",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: GetArgs = parse_args(args)?;
                let (found, tasks) =
                    workflow::get(&ctx.db, &input.workflow_id, input.include_tasks).await?;
                let mut value = to_value(&found)?;
                if let Some(tasks) = tasks {
                    value["tasks"] = to_value(&tasks)?;
                }
                Ok(value)
            })
        }),
    );

    registry.add(
        "workflow_list",
        "List workflows, optionally filtered by status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ListArgs = parse_args(args)?;
                let workflows = workflow::list(&ctx.db, input.status).await?;
                to_value(&workflows)
            })
        }),
    );

    registry.add(
        "workflow_set_plan",
        "Install a plan and move the workflow to ready",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: SetPlanArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                let tasks =
                    workflow::set_plan(&ctx.db, &input.workflow_id, &input.summary, &input.tasks)
                        .await?;
                to_value(&tasks)
            })
        }),
    );

    registry.add(
        "workflow_update_status",
        "Transition a workflow's status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: UpdateStatusArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                let updated = workflow::update_status(
                    &ctx.db,
                    &input.workflow_id,
                    input.status,
                    input.reason.as_deref(),
                )
                .await?;
                to_value(&updated)
            })
        }),
    );

    registry.add(
        "workflow_set_parallelism",
        "Update max_parallel_tasks",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: SetParallelismArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                // A live spawner also takes the new cap for its pool.
                match spawner_for(&ctx, &input.workflow_id) {
                    Some(spawner) if input.max_parallel_tasks >= 1 => {
                        spawner.set_max_agents(input.max_parallel_tasks as usize).await?;
                    }
                    _ => {
                        workflow::set_parallelism(
                            &ctx.db,
                            &input.workflow_id,
                            input.max_parallel_tasks,
                        )
                        .await?;
                    }
                }
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "workflow_get_summary",
        "Progress digest in text or json form",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: GetSummaryArgs = parse_args(args)?;
                workflow::get_summary(&ctx.db, &input.workflow_id, &input.format).await
            })
        }),
    );

    registry.add(
        "workflow_lock",
        "Acquire the exclusive write lock for a session",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: LockArgs = parse_args(args)?;
                let result = lock::lock(&ctx.db, &input.workflow_id, &input.session_id).await?;
                to_value(&result)
            })
        }),
    );

    registry.add(
        "workflow_unlock",
        "Release the write lock",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: LockArgs = parse_args(args)?;
                let result = lock::unlock(&ctx.db, &input.workflow_id, &input.session_id).await?;
                to_value(&result)
            })
        }),
    );

    registry.add(
        "workflow_lock_info",
        "Current lock holder, if any",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let info = lock::get_lock_info(&ctx.db, &input.workflow_id).await?;
                Ok(serde_json::json!({ "locked": info.is_some(), "lock": info }))
            })
        }),
    );

    registry.add(
        "workflow_add_repository",
        "Associate a registered repository with a workflow",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: RepositoryArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                workflow::add_repository(&ctx.db, &input.workflow_id, &input.repository_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "workflow_remove_repository",
        "Remove a repository association",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: RepositoryArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                workflow::remove_repository(&ctx.db, &input.workflow_id, &input.repository_id)
                    .await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "workflow_list_repositories",
        "Repositories associated with a workflow",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let repositories = workflow::list_repositories(&ctx.db, &input.workflow_id).await?;
                to_value(&repositories)
            })
        }),
    );

    registry.add(
        "workflow_add_task",
        "Append a task to an existing plan",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: AddTaskArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                let task = workflow::add_task(&ctx.db, &input.workflow_id, &input.spec).await?;
                to_value(&task)
            })
        }),
    );

    registry.add(
        "workflow_remove_task",
        "Remove a not-yet-started task",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: RemoveTaskArgs = parse_args(args)?;
                let task = crate::services::require_task(&ctx.db, &input.task_id).await?;
                lock::guard(&ctx.db, &task.workflow_id, input.session_id.as_deref()).await?;
                workflow::remove_task(&ctx.db, &input.task_id).await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "workflow_replan",
        "Replace the removable subset of a plan",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ReplanArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                let tasks = workflow::replan(&ctx.db, &input.workflow_id, &input.input).await?;
                to_value(&tasks)
            })
        }),
    );

    registry.add(
        "workflow_start",
        "Start executing a workflow with spawned agents",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: StartArgs = parse_args(args)?;
                lock::guard(&ctx.db, &input.workflow_id, input.session_id.as_deref()).await?;
                let found = crate::services::require_workflow(&ctx.db, &input.workflow_id).await?;

                let config = SpawnerConfig {
                    max_agents: input.max_agents,
                    permission_mode: if input.bypass_permissions {
                        PermissionMode::BypassPermissions
                    } else {
                        PermissionMode::CawToolsOnly
                    },
                    ephemeral_worktree: input.ephemeral_worktree,
                    ..SpawnerConfig::new(ctx.mcp_port)
                };

                let spawner = WorkflowSpawner::new(
                    ctx.db.clone(),
                    input.workflow_id.clone(),
                    Arc::clone(&ctx.launcher),
                    config,
                    found.max_parallel_tasks,
                );
                ctx.registry.register(Arc::clone(&spawner))?;

                // Detached runs clean up their registry slot on any
                // terminal event so the workflow can be started again.
                {
                    let registry = Arc::clone(&ctx.registry);
                    let workflow_id = input.workflow_id.clone();
                    spawner.listeners().on_any(move |event| {
                        if event.is_terminal() {
                            registry.remove(&workflow_id);
                        }
                    });
                }

                match runner::run_workflow(
                    Arc::clone(&spawner),
                    RunnerOptions {
                        detach: true,
                        ..Default::default()
                    },
                )
                .await
                {
                    Ok(_) => Ok(serde_json::json!({
                        "started": true,
                        "workflow_id": input.workflow_id,
                    })),
                    Err(e) => {
                        ctx.registry.remove(&input.workflow_id);
                        // Infrastructure failures inside the spawner get
                        // their own code; state-machine rejections pass
                        // through untouched.
                        if e.code == ErrorCode::InternalError {
                            Err(ToolError::new(ErrorCode::SpawnerError, e.message))
                        } else {
                            Err(e)
                        }
                    }
                }
            })
        }),
    );

    registry.add(
        "workflow_suspend",
        "Suspend execution: stop agents, pause tasks",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let spawner = spawner_for(&ctx, &input.workflow_id).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::NotRunning,
                        format!("workflow {} is not being executed", input.workflow_id),
                    )
                })?;
                let agents_stopped = spawner.suspend().await?;
                Ok(serde_json::json!({
                    "success": true,
                    "agents_stopped": agents_stopped,
                }))
            })
        }),
    );

    registry.add(
        "workflow_resume",
        "Resume a suspended workflow",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let spawner = match spawner_for(&ctx, &input.workflow_id) {
                    Some(spawner) => spawner,
                    None => {
                        // Daemon restarted since the suspend; rebuild from
                        // the workflow row.
                        let found =
                            crate::services::require_workflow(&ctx.db, &input.workflow_id).await?;
                        let spawner = WorkflowSpawner::new(
                            ctx.db.clone(),
                            input.workflow_id.clone(),
                            Arc::clone(&ctx.launcher),
                            SpawnerConfig::new(ctx.mcp_port),
                            found.max_parallel_tasks,
                        );
                        ctx.registry.register(Arc::clone(&spawner))?;
                        spawner
                    }
                };
                spawner.resume().await?;
                Ok(serde_json::json!({ "success": true }))
            })
        }),
    );

    registry.add(
        "workflow_execution_status",
        "Snapshot of the running spawner",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let spawner = spawner_for(&ctx, &input.workflow_id).ok_or_else(|| {
                    ToolError::new(
                        ErrorCode::NotRunning,
                        format!("workflow {} is not being executed", input.workflow_id),
                    )
                })?;
                let status = spawner.get_status().await?;
                to_value(&status)
            })
        }),
    );

    registry.add(
        "workflow_next_tasks",
        "Unblocked, unassigned tasks ready to run",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: NextTasksArgs = parse_args(args)?;
                let next = orchestration::get_next_tasks(
                    &ctx.db,
                    &input.workflow_id,
                    input.include_failed,
                )
                .await?;
                to_value(&next)
            })
        }),
    );

    registry.add(
        "workflow_progress",
        "Task counts by status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: WorkflowId = parse_args(args)?;
                let progress = orchestration::get_progress(&ctx.db, &input.workflow_id).await?;
                to_value(&progress)
            })
        }),
    );
}
