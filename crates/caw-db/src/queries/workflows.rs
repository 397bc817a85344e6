//! Query functions for the `workflows` and `workflow_repositories` tables.

use anyhow::{Context, Result};
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::models::{Repository, Workflow, WorkflowSource, WorkflowStatus};
use crate::{ids, now_ms};

/// Fields for a new workflow row.
#[derive(Debug, Clone)]
pub struct NewWorkflow<'a> {
    pub name: &'a str,
    pub source: WorkflowSource,
    pub source_reference: Option<&'a str>,
    pub source_content: Option<&'a str>,
    pub max_parallel_tasks: i64,
    pub auto_create_workspaces: bool,
}

/// Insert a new workflow in `planning` status.
pub async fn insert_workflow(pool: &SqlitePool, new: &NewWorkflow<'_>) -> Result<Workflow> {
    let id = ids::generate(ids::prefix::WORKFLOW);
    let now = now_ms();

    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows \
         (id, name, source, source_reference, source_content, status, \
          max_parallel_tasks, auto_create_workspaces, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 'planning', ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(new.name)
    .bind(new.source)
    .bind(new.source_reference)
    .bind(new.source_content)
    .bind(new.max_parallel_tasks)
    .bind(new.auto_create_workspaces)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

/// Fetch a single workflow by id.
pub async fn get_workflow(pool: &SqlitePool, id: &str) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List workflows, optionally filtered by status, newest first.
pub async fn list_workflows(
    pool: &SqlitePool,
    status: Option<WorkflowStatus>,
) -> Result<Vec<Workflow>> {
    let workflows = match status {
        Some(status) => {
            sqlx::query_as::<_, Workflow>(
                "SELECT * FROM workflows WHERE status = ? ORDER BY created_at DESC",
            )
            .bind(status)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as::<_, Workflow>("SELECT * FROM workflows ORDER BY created_at DESC")
                .fetch_all(pool)
                .await
        }
    }
    .context("failed to list workflows")?;

    Ok(workflows)
}

/// Atomically transition a workflow's status.
///
/// Optimistic locking: the WHERE clause pins the expected `from` status.
/// Returns rows-affected (0 means the status did not match or the row is
/// missing).
pub async fn transition_workflow_status(
    pool: &SqlitePool,
    id: &str,
    from: WorkflowStatus,
    to: WorkflowStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflows SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
    )
    .bind(to)
    .bind(now_ms())
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition workflow status")?;

    Ok(result.rows_affected())
}

/// Set the plan summary (used by `set_plan` inside its transaction).
pub async fn set_plan_summary(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    summary: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE workflows SET plan_summary = ?, status = 'ready', updated_at = ? WHERE id = ?",
    )
    .bind(summary)
    .bind(now_ms())
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("failed to set plan summary")?;

    Ok(())
}

/// Overwrite the free-form config blob.
pub async fn set_config(pool: &SqlitePool, id: &str, config: Option<&str>) -> Result<u64> {
    let result = sqlx::query("UPDATE workflows SET config = ?, updated_at = ? WHERE id = ?")
        .bind(config)
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set workflow config")?;

    Ok(result.rows_affected())
}

/// Update `max_parallel_tasks`.
pub async fn set_parallelism(pool: &SqlitePool, id: &str, max_parallel_tasks: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workflows SET max_parallel_tasks = ?, updated_at = ? WHERE id = ?",
    )
    .bind(max_parallel_tasks)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to set workflow parallelism")?;

    Ok(result.rows_affected())
}

/// Update the plan summary only (used by replan).
pub async fn update_plan_summary(
    tx: &mut Transaction<'_, Sqlite>,
    id: &str,
    summary: &str,
) -> Result<()> {
    sqlx::query("UPDATE workflows SET plan_summary = ?, updated_at = ? WHERE id = ?")
        .bind(summary)
        .bind(now_ms())
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("failed to update plan summary")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Repository association
// ---------------------------------------------------------------------------

/// Link a repository to a workflow. Idempotent.
pub async fn add_repository(pool: &SqlitePool, workflow_id: &str, repository_id: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflow_repositories (workflow_id, repository_id) VALUES (?, ?) \
         ON CONFLICT DO NOTHING",
    )
    .bind(workflow_id)
    .bind(repository_id)
    .execute(pool)
    .await
    .context("failed to add workflow repository")?;

    Ok(())
}

/// Unlink a repository from a workflow. Returns rows-affected.
pub async fn remove_repository(
    pool: &SqlitePool,
    workflow_id: &str,
    repository_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM workflow_repositories WHERE workflow_id = ? AND repository_id = ?",
    )
    .bind(workflow_id)
    .bind(repository_id)
    .execute(pool)
    .await
    .context("failed to remove workflow repository")?;

    Ok(result.rows_affected())
}

/// List the repositories associated with a workflow.
pub async fn list_repositories(pool: &SqlitePool, workflow_id: &str) -> Result<Vec<Repository>> {
    let repositories = sqlx::query_as::<_, Repository>(
        "SELECT r.* FROM repositories r \
         JOIN workflow_repositories wr ON wr.repository_id = r.id \
         WHERE wr.workflow_id = ? \
         ORDER BY r.path",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow repositories")?;

    Ok(repositories)
}

/// Count workflows currently referencing a repository.
pub async fn count_repository_usage(pool: &SqlitePool, repository_id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM workflow_repositories WHERE repository_id = ?",
    )
    .bind(repository_id)
    .fetch_one(pool)
    .await
    .context("failed to count repository usage")?;

    Ok(row.0)
}
