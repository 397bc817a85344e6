//! Workflow service: creation, plan installation, status transitions,
//! replanning, and repository association.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::info;

use caw_db::models::{
    CheckpointType, Task, TaskStatus, Workflow, WorkflowSource, WorkflowStatus,
};
use caw_db::queries::checkpoints as checkpoint_db;
use caw_db::queries::repositories as repo_db;
use caw_db::queries::tasks as task_db;
use caw_db::queries::workflows as workflow_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::require_workflow;
use crate::state::WorkflowStateMachine;

/// One task of a submitted plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Inputs for [`create`].
#[derive(Debug, Clone, Deserialize)]
pub struct CreateWorkflow {
    pub name: String,
    #[serde(default = "default_source")]
    pub source: WorkflowSource,
    #[serde(default)]
    pub source_reference: Option<String>,
    #[serde(default)]
    pub source_content: Option<String>,
    #[serde(default = "default_parallelism")]
    pub max_parallel_tasks: i64,
    #[serde(default)]
    pub auto_create_workspaces: bool,
}

fn default_source() -> WorkflowSource {
    WorkflowSource::Prompt
}

fn default_parallelism() -> i64 {
    1
}

/// Create a workflow in `planning` status.
pub async fn create(pool: &SqlitePool, input: &CreateWorkflow) -> ToolResult<Workflow> {
    if input.name.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::InvalidInput, "workflow name must not be empty"));
    }
    if input.max_parallel_tasks < 1 {
        return Err(ToolError::new(
            ErrorCode::InvalidInput,
            "max_parallel_tasks must be at least 1",
        ));
    }

    let workflow = workflow_db::insert_workflow(
        pool,
        &workflow_db::NewWorkflow {
            name: &input.name,
            source: input.source,
            source_reference: input.source_reference.as_deref(),
            source_content: input.source_content.as_deref(),
            max_parallel_tasks: input.max_parallel_tasks,
            auto_create_workspaces: input.auto_create_workspaces,
        },
    )
    .await?;

    info!(workflow_id = %workflow.id, name = %workflow.name, "workflow created");
    Ok(workflow)
}

/// Fetch a workflow, optionally with its tasks.
pub async fn get(
    pool: &SqlitePool,
    id: &str,
    include_tasks: bool,
) -> ToolResult<(Workflow, Option<Vec<Task>>)> {
    let workflow = require_workflow(pool, id).await?;
    let tasks = if include_tasks {
        Some(task_db::list_tasks_for_workflow(pool, id).await?)
    } else {
        None
    };
    Ok((workflow, tasks))
}

/// List workflows, optionally filtered by status.
pub async fn list(pool: &SqlitePool, status: Option<WorkflowStatus>) -> ToolResult<Vec<Workflow>> {
    Ok(workflow_db::list_workflows(pool, status).await?)
}

/// Validate a set of task specs against each other and a set of names that
/// already exist (empty for `set_plan`, the preserved tasks for `replan`).
fn validate_specs(specs: &[TaskSpec], existing_names: &HashSet<String>) -> ToolResult<()> {
    let mut seen: HashSet<&str> = HashSet::new();

    for spec in specs {
        if spec.name.trim().is_empty() {
            return Err(ToolError::new(ErrorCode::InvalidInput, "task name must not be empty"));
        }
        if existing_names.contains(&spec.name) {
            return Err(ToolError::new(
                ErrorCode::NameConflict,
                format!("task name {:?} conflicts with a preserved task", spec.name),
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            return Err(ToolError::new(
                ErrorCode::DuplicateTaskName,
                format!("duplicate task name {:?}", spec.name),
            ));
        }
    }

    let known: HashSet<&str> = specs
        .iter()
        .map(|s| s.name.as_str())
        .chain(existing_names.iter().map(|s| s.as_str()))
        .collect();

    for spec in specs {
        for dep in &spec.depends_on {
            if dep == &spec.name {
                return Err(ToolError::new(
                    ErrorCode::SelfDependency,
                    format!("task {:?} depends on itself", spec.name),
                ));
            }
            if !known.contains(dep.as_str()) {
                return Err(ToolError::new(
                    ErrorCode::UnknownDependency,
                    format!("task {:?} depends on unknown task {:?}", spec.name, dep),
                ));
            }
        }
    }

    Ok(())
}

/// Install a plan: insert every task with its dependency edges and move the
/// workflow `planning -> ready`. Tasks with dependencies start `blocked`.
pub async fn set_plan(
    pool: &SqlitePool,
    workflow_id: &str,
    summary: &str,
    specs: &[TaskSpec],
) -> ToolResult<Vec<Task>> {
    let workflow = require_workflow(pool, workflow_id).await?;
    if workflow.status != WorkflowStatus::Planning {
        return Err(ToolError::new(
            ErrorCode::InvalidState,
            format!(
                "workflow {workflow_id} has status {}, expected planning",
                workflow.status
            ),
        ));
    }
    if specs.is_empty() {
        return Err(ToolError::new(ErrorCode::InvalidInput, "a plan needs at least one task"));
    }
    validate_specs(specs, &HashSet::new())?;

    let mut tx = pool.begin().await.map_err(ToolError::internal)?;

    let mut name_to_id: HashMap<String, String> = HashMap::new();
    let mut tasks = Vec::with_capacity(specs.len());

    for (index, spec) in specs.iter().enumerate() {
        let task = task_db::insert_task(
            &mut tx,
            &task_db::NewTask {
                workflow_id,
                name: &spec.name,
                description: &spec.description,
                sequence: (index + 1) as i64,
                parallel_group: spec.parallel_group.as_deref(),
                context_from: None,
            },
        )
        .await?;
        name_to_id.insert(spec.name.clone(), task.id.clone());
        tasks.push(task);
    }

    for spec in specs {
        let task_id = &name_to_id[&spec.name];
        for dep_name in &spec.depends_on {
            task_db::insert_dependency(&mut tx, task_id, &name_to_id[dep_name]).await?;
        }
        if !spec.depends_on.is_empty() {
            task_db::mark_blocked(&mut tx, task_id).await?;
        }
    }

    workflow_db::set_plan_summary(&mut tx, workflow_id, summary).await?;
    tx.commit().await.map_err(ToolError::internal)?;

    info!(workflow_id, task_count = specs.len(), "plan installed");
    Ok(task_db::list_tasks_for_workflow(pool, workflow_id).await?)
}

/// Transition the workflow's status through the state machine.
pub async fn update_status(
    pool: &SqlitePool,
    workflow_id: &str,
    to: WorkflowStatus,
    reason: Option<&str>,
) -> ToolResult<Workflow> {
    let workflow = require_workflow(pool, workflow_id).await?;
    WorkflowStateMachine::transition(pool, workflow_id, workflow.status, to).await?;
    if let Some(reason) = reason {
        info!(workflow_id, from = %workflow.status, %to, reason, "workflow status updated");
    } else {
        info!(workflow_id, from = %workflow.status, %to, "workflow status updated");
    }
    require_workflow(pool, workflow_id).await
}

/// Update `max_parallel_tasks`.
pub async fn set_parallelism(pool: &SqlitePool, workflow_id: &str, n: i64) -> ToolResult<()> {
    if n < 1 {
        return Err(ToolError::new(
            ErrorCode::InvalidInput,
            "max_parallel_tasks must be at least 1",
        ));
    }
    let rows = workflow_db::set_parallelism(pool, workflow_id, n).await?;
    if rows == 0 {
        return Err(ToolError::new(
            ErrorCode::WorkflowNotFound,
            format!("workflow {workflow_id} not found"),
        ));
    }
    Ok(())
}

/// Human-readable or structured progress digest.
pub async fn get_summary(
    pool: &SqlitePool,
    workflow_id: &str,
    format: &str,
) -> ToolResult<serde_json::Value> {
    let workflow = require_workflow(pool, workflow_id).await?;
    let tasks = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    let progress = task_db::get_progress(pool, workflow_id).await?;

    match format {
        "json" => Ok(serde_json::json!({
            "id": workflow.id,
            "name": workflow.name,
            "status": workflow.status,
            "plan_summary": workflow.plan_summary,
            "progress": progress,
            "tasks": tasks.iter().map(|t| serde_json::json!({
                "name": t.name,
                "status": t.status,
                "sequence": t.sequence,
            })).collect::<Vec<_>>(),
        })),
        "text" => {
            let mut out = format!(
                "{} [{}] {}/{} tasks done\n",
                workflow.name,
                workflow.status,
                progress.completed + progress.skipped,
                progress.total
            );
            if let Some(summary) = &workflow.plan_summary {
                out.push_str(summary);
                out.push('\n');
            }
            for task in &tasks {
                out.push_str(&format!("  {}. {} [{}]\n", task.sequence, task.name, task.status));
            }
            Ok(serde_json::json!({ "summary": out }))
        }
        other => Err(ToolError::new(
            ErrorCode::InvalidInput,
            format!("unknown summary format {other:?}; expected text or json"),
        )),
    }
}

/// Append a single task to an existing plan.
pub async fn add_task(
    pool: &SqlitePool,
    workflow_id: &str,
    spec: &TaskSpec,
) -> ToolResult<Task> {
    require_workflow(pool, workflow_id).await?;

    let existing = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    if existing.iter().any(|t| t.name == spec.name) {
        return Err(ToolError::new(
            ErrorCode::DuplicateTaskName,
            format!("duplicate task name {:?}", spec.name),
        ));
    }

    let mut dep_ids = Vec::new();
    for dep_name in &spec.depends_on {
        if dep_name == &spec.name {
            return Err(ToolError::new(
                ErrorCode::SelfDependency,
                format!("task {:?} depends on itself", spec.name),
            ));
        }
        let dep = existing.iter().find(|t| &t.name == dep_name).ok_or_else(|| {
            ToolError::new(
                ErrorCode::UnknownDependency,
                format!("task {:?} depends on unknown task {:?}", spec.name, dep_name),
            )
        })?;
        dep_ids.push(dep.id.clone());
    }
    let deps_met = spec
        .depends_on
        .iter()
        .all(|name| existing.iter().any(|t| &t.name == name && t.status.is_terminal()));

    let mut tx = pool.begin().await.map_err(ToolError::internal)?;
    let sequence = task_db::max_sequence(&mut tx, workflow_id).await? + 1;
    let task = task_db::insert_task(
        &mut tx,
        &task_db::NewTask {
            workflow_id,
            name: &spec.name,
            description: &spec.description,
            sequence,
            parallel_group: spec.parallel_group.as_deref(),
            context_from: None,
        },
    )
    .await?;
    for dep_id in &dep_ids {
        task_db::insert_dependency(&mut tx, &task.id, dep_id).await?;
    }
    if !dep_ids.is_empty() && !deps_met {
        task_db::mark_blocked(&mut tx, &task.id).await?;
    }
    tx.commit().await.map_err(ToolError::internal)?;

    Ok(task_db::get_task(pool, &task.id).await?.unwrap_or(task))
}

/// Whether a task can be deleted by remove/replan: never started and not
/// claimed by any agent.
fn is_removable(task: &Task) -> bool {
    matches!(task.status, TaskStatus::Pending | TaskStatus::Blocked)
        || (task.status == TaskStatus::Planning && task.assigned_agent_id.is_none())
}

/// Remove a single task from a plan and close the sequence gap.
pub async fn remove_task(pool: &SqlitePool, task_id: &str) -> ToolResult<()> {
    let task = crate::services::require_task(pool, task_id).await?;
    if !is_removable(&task) {
        return Err(ToolError::new(
            ErrorCode::TaskNotRemovable,
            format!("task {task_id} has status {} and cannot be removed", task.status),
        ));
    }

    let mut tx = pool.begin().await.map_err(ToolError::internal)?;
    task_db::delete_task(&mut tx, task_id).await?;
    task_db::resequence(&mut tx, &task.workflow_id).await?;
    tx.commit().await.map_err(ToolError::internal)?;

    Ok(())
}

/// Inputs for [`replan`].
#[derive(Debug, Clone, Deserialize)]
pub struct ReplanInput {
    pub summary: String,
    #[serde(default)]
    pub reason: Option<String>,
    pub tasks: Vec<TaskSpec>,
}

/// Replace the removable subset of a workflow's tasks with a new plan.
///
/// Preserved tasks (anything started, claimed, or terminal) keep their
/// rows; removable tasks are deleted; new tasks are appended. New-task
/// dependencies may reference preserved or new task names. A `replan`
/// checkpoint is recorded on every surviving and newly added task.
pub async fn replan(
    pool: &SqlitePool,
    workflow_id: &str,
    input: &ReplanInput,
) -> ToolResult<Vec<Task>> {
    require_workflow(pool, workflow_id).await?;

    let existing = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    let (removable, preserved): (Vec<_>, Vec<_>) =
        existing.into_iter().partition(is_removable);

    let preserved_names: HashSet<String> = preserved.iter().map(|t| t.name.clone()).collect();
    validate_specs(&input.tasks, &preserved_names)?;

    let mut tx = pool.begin().await.map_err(ToolError::internal)?;

    for task in &removable {
        task_db::delete_task(&mut tx, &task.id).await?;
    }

    let mut name_to_id: HashMap<String, String> = preserved
        .iter()
        .map(|t| (t.name.clone(), t.id.clone()))
        .collect();

    let mut next_sequence = task_db::max_sequence(&mut tx, workflow_id).await?;
    let mut added = Vec::with_capacity(input.tasks.len());
    for spec in &input.tasks {
        next_sequence += 1;
        let task = task_db::insert_task(
            &mut tx,
            &task_db::NewTask {
                workflow_id,
                name: &spec.name,
                description: &spec.description,
                sequence: next_sequence,
                parallel_group: spec.parallel_group.as_deref(),
                context_from: None,
            },
        )
        .await?;
        name_to_id.insert(spec.name.clone(), task.id.clone());
        added.push(task);
    }

    for spec in &input.tasks {
        let task_id = &name_to_id[&spec.name];
        let mut unmet = false;
        for dep_name in &spec.depends_on {
            task_db::insert_dependency(&mut tx, task_id, &name_to_id[dep_name]).await?;
            let satisfied = preserved
                .iter()
                .any(|t| &t.name == dep_name && t.status.is_terminal());
            if !satisfied {
                unmet = true;
            }
        }
        if unmet {
            task_db::mark_blocked(&mut tx, task_id).await?;
        }
    }

    task_db::resequence(&mut tx, workflow_id).await?;
    workflow_db::update_plan_summary(&mut tx, workflow_id, &input.summary).await?;
    tx.commit().await.map_err(ToolError::internal)?;

    // Checkpoints are append-only records outside the plan transaction;
    // best-effort, the replan itself has already committed.
    let note = input.reason.as_deref().unwrap_or("workflow replanned");
    for task in preserved.iter().chain(added.iter()) {
        let _ = checkpoint_db::insert_checkpoint(
            pool,
            &task.id,
            CheckpointType::Replan,
            note,
            None,
            None,
        )
        .await;
    }

    info!(
        workflow_id,
        removed = removable.len(),
        added = added.len(),
        preserved = preserved.len(),
        "workflow replanned"
    );

    Ok(task_db::list_tasks_for_workflow(pool, workflow_id).await?)
}

// ---------------------------------------------------------------------------
// Repository association
// ---------------------------------------------------------------------------

/// Associate a registered repository with a workflow.
pub async fn add_repository(
    pool: &SqlitePool,
    workflow_id: &str,
    repository_id: &str,
) -> ToolResult<()> {
    require_workflow(pool, workflow_id).await?;
    if repo_db::get_repository(pool, repository_id).await?.is_none() {
        return Err(ToolError::new(
            ErrorCode::RepositoryNotFound,
            format!("repository {repository_id} not found"),
        ));
    }
    workflow_db::add_repository(pool, workflow_id, repository_id).await?;
    Ok(())
}

/// Remove a repository association.
pub async fn remove_repository(
    pool: &SqlitePool,
    workflow_id: &str,
    repository_id: &str,
) -> ToolResult<()> {
    require_workflow(pool, workflow_id).await?;
    let rows = workflow_db::remove_repository(pool, workflow_id, repository_id).await?;
    if rows == 0 {
        return Err(ToolError::new(
            ErrorCode::RepositoryNotFound,
            format!("repository {repository_id} is not associated with workflow {workflow_id}"),
        ));
    }
    Ok(())
}

/// List the repositories associated with a workflow.
pub async fn list_repositories(
    pool: &SqlitePool,
    workflow_id: &str,
) -> ToolResult<Vec<caw_db::models::Repository>> {
    require_workflow(pool, workflow_id).await?;
    Ok(workflow_db::list_repositories(pool, workflow_id).await?)
}
