//! Workspace service: named git worktrees bound to workflows.

use sqlx::SqlitePool;

use caw_db::models::{Workspace, WorkspaceStatus};
use caw_db::queries::workspaces as workspace_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::require_workflow;

/// Create a workspace record in `active` status.
pub async fn create(
    pool: &SqlitePool,
    workflow_id: &str,
    path: &str,
    branch: &str,
    base_branch: &str,
) -> ToolResult<Workspace> {
    require_workflow(pool, workflow_id).await?;
    if path.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::MissingPath, "workspace path must not be empty"));
    }
    if branch.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::InvalidInput, "workspace branch must not be empty"));
    }

    Ok(workspace_db::insert_workspace(
        pool,
        &workspace_db::NewWorkspace {
            workflow_id,
            path,
            branch,
            base_branch,
        },
    )
    .await?)
}

/// Update a workspace. Moving to `merged` requires a merge commit.
pub async fn update(
    pool: &SqlitePool,
    workspace_id: &str,
    status: Option<WorkspaceStatus>,
    pr_url: Option<&str>,
    merge_commit: Option<&str>,
) -> ToolResult<Workspace> {
    let workspace = workspace_db::get_workspace(pool, workspace_id)
        .await?
        .ok_or_else(|| {
            ToolError::new(
                ErrorCode::WorkspaceNotFound,
                format!("workspace {workspace_id} not found"),
            )
        })?;

    if status == Some(WorkspaceStatus::Merged)
        && merge_commit.map(str::trim).filter(|s| !s.is_empty()).is_none()
        && workspace.merge_commit.is_none()
    {
        return Err(ToolError::new(
            ErrorCode::MissingMergeCommit,
            "marking a workspace merged requires merge_commit",
        ));
    }

    workspace_db::update_workspace(
        pool,
        workspace_id,
        &workspace_db::WorkspaceUpdate {
            status,
            pr_url,
            merge_commit,
        },
    )
    .await?;

    Ok(workspace_db::get_workspace(pool, workspace_id)
        .await?
        .unwrap_or(workspace))
}

/// List workspaces, optionally filtered by workflow and status.
pub async fn list(
    pool: &SqlitePool,
    workflow_id: Option<&str>,
    status: Option<WorkspaceStatus>,
) -> ToolResult<Vec<Workspace>> {
    if let Some(workflow_id) = workflow_id {
        require_workflow(pool, workflow_id).await?;
    }
    Ok(workspace_db::list_workspaces(pool, workflow_id, status).await?)
}
