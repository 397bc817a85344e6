//! Query functions for the `tasks` and `task_dependencies` tables.
//!
//! The claim and transition functions use conditional updates and report
//! rows-affected; callers treat 0 as an optimistic-lock miss and re-read.

use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{Task, TaskStatus};
use crate::{ids, now_ms};

/// Fields for a new task row.
#[derive(Debug, Clone)]
pub struct NewTask<'a> {
    pub workflow_id: &'a str,
    pub name: &'a str,
    pub description: &'a str,
    pub sequence: i64,
    pub parallel_group: Option<&'a str>,
    pub context_from: Option<&'a str>,
}

/// Insert a new task in `pending` status.
pub async fn insert_task(tx: &mut Transaction<'_, Sqlite>, new: &NewTask<'_>) -> Result<Task> {
    let id = ids::generate(ids::prefix::TASK);
    let now = now_ms();

    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
         (id, workflow_id, name, description, status, sequence, parallel_group, \
          context_from, created_at, updated_at) \
         VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(new.workflow_id)
    .bind(new.name)
    .bind(new.description)
    .bind(new.sequence)
    .bind(new.parallel_group)
    .bind(new.context_from)
    .bind(now)
    .bind(now)
    .fetch_one(&mut **tx)
    .await
    .with_context(|| format!("failed to insert task {:?}", new.name))?;

    Ok(task)
}

/// Fetch a single task by id.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by its workflow-unique name.
pub async fn get_task_by_name(
    pool: &SqlitePool,
    workflow_id: &str,
    name: &str,
) -> Result<Option<Task>> {
    let task =
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE workflow_id = ? AND name = ?")
            .bind(workflow_id)
            .bind(name)
            .fetch_optional(pool)
            .await
            .context("failed to fetch task by name")?;

    Ok(task)
}

/// List all tasks for a workflow, ordered by sequence.
pub async fn list_tasks_for_workflow(pool: &SqlitePool, workflow_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = ? ORDER BY sequence ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for workflow")?;

    Ok(tasks)
}

/// Largest sequence currently used by a workflow's tasks (0 when empty).
pub async fn max_sequence(tx: &mut Transaction<'_, Sqlite>, workflow_id: &str) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(sequence), 0) FROM tasks WHERE workflow_id = ?")
            .bind(workflow_id)
            .fetch_one(&mut **tx)
            .await
            .context("failed to read max task sequence")?;

    Ok(row.0)
}

/// Mark a freshly inserted task `blocked` (plan installation marks tasks
/// with unmet dependencies before the transaction commits).
pub async fn mark_blocked(tx: &mut Transaction<'_, Sqlite>, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = 'blocked' WHERE id = ? AND status = 'pending'")
        .bind(task_id)
        .execute(&mut **tx)
        .await
        .context("failed to mark task blocked")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

/// Atomically transition a task's status. Returns rows-affected.
pub async fn transition_task_status(
    pool: &SqlitePool,
    task_id: &str,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result =
        sqlx::query("UPDATE tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?")
            .bind(to)
            .bind(now_ms())
            .bind(task_id)
            .bind(from)
            .execute(pool)
            .await
            .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Complete a task: `in_progress -> completed` with the outcome recorded
/// and the assignment cleared. Returns rows-affected.
pub async fn complete_task(pool: &SqlitePool, task_id: &str, outcome: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'completed', outcome = ?, \
             assigned_agent_id = NULL, claimed_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(outcome)
    .bind(now_ms())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to complete task")?;

    Ok(result.rows_affected())
}

/// Fail a task: `in_progress -> failed` with the error recorded and the
/// assignment cleared. Returns rows-affected.
pub async fn fail_task(pool: &SqlitePool, task_id: &str, error: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'failed', error = ?, \
             assigned_agent_id = NULL, claimed_at = NULL, updated_at = ? \
         WHERE id = ? AND status = 'in_progress'",
    )
    .bind(error)
    .bind(now_ms())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to fail task")?;

    Ok(result.rows_affected())
}

/// Claim a task for an agent.
///
/// The linearization point of the claim protocol: a single conditional
/// update that only succeeds when the task is unassigned and claimable.
/// Returns rows-affected (0 means lost the race or wrong state).
pub async fn claim_task(pool: &SqlitePool, task_id: &str, agent_id: &str) -> Result<u64> {
    let now = now_ms();
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent_id = ?, claimed_at = ?, status = 'planning', updated_at = ? \
         WHERE id = ? AND assigned_agent_id IS NULL \
           AND status IN ('pending', 'blocked', 'planning')",
    )
    .bind(agent_id)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Adopt an unassigned `in_progress` task (the resume path: a paused task
/// moved back to `in_progress` with its assignment cleared, waiting for a
/// fresh agent). Returns rows-affected.
pub async fn adopt_task(pool: &SqlitePool, task_id: &str, agent_id: &str) -> Result<u64> {
    let now = now_ms();
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent_id = ?, claimed_at = ?, updated_at = ? \
         WHERE id = ? AND assigned_agent_id IS NULL AND status = 'in_progress'",
    )
    .bind(agent_id)
    .bind(now)
    .bind(now)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to adopt task")?;

    Ok(result.rows_affected())
}

/// Release a claim held by `agent_id`.
///
/// Clears the assignment and resets a non-terminal working status back to
/// `pending`. Returns rows-affected (0 means this agent does not hold the
/// claim).
pub async fn release_task(pool: &SqlitePool, task_id: &str, agent_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent_id = NULL, claimed_at = NULL, \
             status = CASE WHEN status IN ('planning', 'in_progress') THEN 'pending' ELSE status END, \
             updated_at = ? \
         WHERE id = ? AND assigned_agent_id = ?",
    )
    .bind(now_ms())
    .bind(task_id)
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to release task")?;

    Ok(result.rows_affected())
}

/// Release every task an agent still holds (agent teardown / stale-agent
/// cleanup). Returns rows-affected.
pub async fn release_tasks_for_agent(pool: &SqlitePool, agent_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET assigned_agent_id = NULL, claimed_at = NULL, \
             status = CASE WHEN status IN ('planning', 'in_progress') THEN 'pending' ELSE status END, \
             updated_at = ? \
         WHERE assigned_agent_id = ?",
    )
    .bind(now_ms())
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to release tasks for agent")?;

    Ok(result.rows_affected())
}

/// Clear the assignment on a task without touching its status (resume path:
/// the task goes back to `in_progress` unassigned so a fresh agent can be
/// registered against it).
pub async fn clear_assignment(pool: &SqlitePool, task_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET assigned_agent_id = NULL, claimed_at = NULL, updated_at = ? \
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to clear task assignment")?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Field updates
// ---------------------------------------------------------------------------

/// Set the serialized plan blob.
pub async fn set_plan(pool: &SqlitePool, task_id: &str, plan: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET plan = ?, updated_at = ? WHERE id = ?")
        .bind(plan)
        .bind(now_ms())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task plan")?;

    Ok(result.rows_affected())
}

/// Set the serialized context blob.
pub async fn set_context(pool: &SqlitePool, task_id: &str, context: &str) -> Result<u64> {
    let result = sqlx::query("UPDATE tasks SET context = ?, updated_at = ? WHERE id = ?")
        .bind(context)
        .bind(now_ms())
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to set task context")?;

    Ok(result.rows_affected())
}

/// Assign a workspace (and optionally a repository) to a task.
pub async fn assign_workspace(
    pool: &SqlitePool,
    task_id: &str,
    workspace_id: &str,
    repository_id: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET workspace_id = ?, repository_id = COALESCE(?, repository_id), updated_at = ? \
         WHERE id = ?",
    )
    .bind(workspace_id)
    .bind(repository_id)
    .bind(now_ms())
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to assign workspace to task")?;

    Ok(result.rows_affected())
}

/// Replace a task's name/description/parallel_group (replan preserves the
/// row but may refresh its description).
pub async fn update_task_fields(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    description: &str,
    parallel_group: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE tasks SET description = ?, parallel_group = ?, updated_at = ? WHERE id = ?",
    )
    .bind(description)
    .bind(parallel_group)
    .bind(now_ms())
    .bind(task_id)
    .execute(&mut **tx)
    .await
    .context("failed to update task fields")?;

    Ok(())
}

/// Delete a task row (removable statuses only; the caller has checked).
pub async fn delete_task(tx: &mut Transaction<'_, Sqlite>, task_id: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(task_id)
        .execute(&mut **tx)
        .await
        .context("failed to delete task")?;

    Ok(result.rows_affected())
}

/// Renumber a workflow's tasks 1..N in current sequence order, closing any
/// gaps left by removals. Runs inside the caller's transaction.
pub async fn resequence(tx: &mut Transaction<'_, Sqlite>, workflow_id: &str) -> Result<()> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM tasks WHERE workflow_id = ? ORDER BY sequence ASC",
    )
    .bind(workflow_id)
    .fetch_all(&mut **tx)
    .await
    .context("failed to list tasks for resequence")?;

    for (index, (task_id,)) in rows.iter().enumerate() {
        sqlx::query("UPDATE tasks SET sequence = ? WHERE id = ?")
            .bind((index + 1) as i64)
            .bind(task_id)
            .execute(&mut **tx)
            .await
            .context("failed to resequence task")?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

/// Insert a dependency edge. Idempotent.
pub async fn insert_dependency(
    tx: &mut Transaction<'_, Sqlite>,
    task_id: &str,
    depends_on: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(&mut **tx)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Fetch the tasks a given task depends on.
pub async fn get_dependencies(pool: &SqlitePool, task_id: &str) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT dep.* FROM task_dependencies td \
         JOIN tasks dep ON dep.id = td.depends_on \
         WHERE td.task_id = ? \
         ORDER BY dep.sequence ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to get task dependencies")?;

    Ok(tasks)
}

/// Fetch the ids of tasks that depend on a given task.
pub async fn get_dependents(pool: &SqlitePool, task_id: &str) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT task_id FROM task_dependencies WHERE depends_on = ?")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependents")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// All dependency edges for a workflow as `(task_id, depends_on)` pairs.
pub async fn list_edges_for_workflow(
    pool: &SqlitePool,
    workflow_id: &str,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT td.task_id, td.depends_on FROM task_dependencies td \
         JOIN tasks t ON t.id = td.task_id \
         WHERE t.workflow_id = ?",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list dependency edges")?;

    Ok(rows)
}

// ---------------------------------------------------------------------------
// Scheduling queries
// ---------------------------------------------------------------------------

/// Tasks that can run next: claimable status, unassigned, and every
/// dependency in a terminal (dependency-satisfying) state. Ordered by
/// sequence; the caller applies parallel-group grouping.
pub async fn get_available_tasks(
    pool: &SqlitePool,
    workflow_id: &str,
    include_failed: bool,
    limit: i64,
) -> Result<Vec<Task>> {
    let statuses = if include_failed {
        "('pending', 'blocked', 'failed')"
    } else {
        "('pending', 'blocked')"
    };

    // Status set is a compile-time constant pair, not user input.
    let sql = format!(
        "SELECT t.* FROM tasks t \
         WHERE t.workflow_id = ? \
           AND t.status IN {statuses} \
           AND t.assigned_agent_id IS NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id \
                 AND dep.status NOT IN ('completed', 'skipped') \
           ) \
         ORDER BY t.sequence ASC \
         LIMIT ?"
    );

    let tasks = sqlx::query_as::<_, Task>(&sql)
        .bind(workflow_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .context("failed to get available tasks")?;

    Ok(tasks)
}

/// Status counts for a workflow's tasks.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkflowProgress {
    pub pending: i64,
    pub blocked: i64,
    pub planning: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub paused: i64,
    pub skipped: i64,
    pub total: i64,
}

/// Aggregate task counts by status.
pub async fn get_progress(pool: &SqlitePool, workflow_id: &str) -> Result<WorkflowProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM tasks WHERE workflow_id = ? GROUP BY status",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to get workflow progress")?;

    let mut progress = WorkflowProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "blocked" => progress.blocked = *count,
            "planning" => progress.planning = *count,
            "in_progress" => progress.in_progress = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            "paused" => progress.paused = *count,
            "skipped" => progress.skipped = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Whether every task of the workflow is terminal (`completed`/`skipped`).
pub async fn all_tasks_terminal(pool: &SqlitePool, workflow_id: &str) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE workflow_id = ? AND status NOT IN ('completed', 'skipped')",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check workflow completion")?;

    Ok(row.0 == 0)
}

/// Tasks in a given status for a workflow.
pub async fn list_tasks_in_status(
    pool: &SqlitePool,
    workflow_id: &str,
    status: TaskStatus,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = ? AND status = ? ORDER BY sequence ASC",
    )
    .bind(workflow_id)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list tasks in status")?;

    Ok(tasks)
}
