//! Query functions for the `workspaces` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::{Workspace, WorkspaceStatus};
use crate::{ids, now_ms};

/// Fields for a new workspace row.
#[derive(Debug, Clone)]
pub struct NewWorkspace<'a> {
    pub workflow_id: &'a str,
    pub path: &'a str,
    pub branch: &'a str,
    pub base_branch: &'a str,
}

/// Insert a new workspace in `active` status.
pub async fn insert_workspace(pool: &SqlitePool, new: &NewWorkspace<'_>) -> Result<Workspace> {
    let id = ids::generate(ids::prefix::WORKSPACE);
    let now = now_ms();

    let workspace = sqlx::query_as::<_, Workspace>(
        "INSERT INTO workspaces \
         (id, workflow_id, path, branch, base_branch, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 'active', ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(new.workflow_id)
    .bind(new.path)
    .bind(new.branch)
    .bind(new.base_branch)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to insert workspace")?;

    Ok(workspace)
}

/// Fetch a single workspace by id.
pub async fn get_workspace(pool: &SqlitePool, id: &str) -> Result<Option<Workspace>> {
    let workspace = sqlx::query_as::<_, Workspace>("SELECT * FROM workspaces WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workspace")?;

    Ok(workspace)
}

/// List workspaces, optionally filtered by workflow and/or status.
pub async fn list_workspaces(
    pool: &SqlitePool,
    workflow_id: Option<&str>,
    status: Option<WorkspaceStatus>,
) -> Result<Vec<Workspace>> {
    let workspaces = sqlx::query_as::<_, Workspace>(
        "SELECT * FROM workspaces \
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
    .context("failed to list workspaces")?;

    Ok(workspaces)
}

/// Mutable workspace fields for [`update_workspace`].
#[derive(Debug, Clone, Default)]
pub struct WorkspaceUpdate<'a> {
    pub status: Option<WorkspaceStatus>,
    pub pr_url: Option<&'a str>,
    pub merge_commit: Option<&'a str>,
}

/// Apply a partial update. Returns rows-affected.
pub async fn update_workspace(
    pool: &SqlitePool,
    id: &str,
    update: &WorkspaceUpdate<'_>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE workspaces SET \
             status = COALESCE(?, status), \
             pr_url = COALESCE(?, pr_url), \
             merge_commit = COALESCE(?, merge_commit), \
             updated_at = ? \
         WHERE id = ?",
    )
    .bind(update.status)
    .bind(update.pr_url)
    .bind(update.merge_commit)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update workspace")?;

    Ok(result.rows_affected())
}

/// Workspaces of a workflow that carry a PR URL (completion classification).
pub async fn list_with_pr_urls(pool: &SqlitePool, workflow_id: &str) -> Result<Vec<Workspace>> {
    let workspaces = sqlx::query_as::<_, Workspace>(
        "SELECT * FROM workspaces \
         WHERE workflow_id = ? AND pr_url IS NOT NULL \
         ORDER BY created_at ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workspaces with PR URLs")?;

    Ok(workspaces)
}
