//! Repository service: canonical records for filesystem paths.

use sqlx::SqlitePool;

use caw_db::models::Repository;
use caw_db::queries::repositories as repo_db;
use caw_db::queries::workflows as workflow_db;

use crate::error::{ErrorCode, ToolError, ToolResult};

/// Register a repository path. Idempotent: the same path always resolves
/// to the same record.
pub async fn register(pool: &SqlitePool, path: &str, name: Option<&str>) -> ToolResult<Repository> {
    if path.trim().is_empty() {
        return Err(ToolError::new(
            ErrorCode::MissingRepoPath,
            "repository path must not be empty",
        ));
    }
    Ok(repo_db::register_repository(pool, path, name).await?)
}

/// Fetch a repository by id, or by path when `id` misses.
pub async fn get(pool: &SqlitePool, id_or_path: &str) -> ToolResult<Repository> {
    if let Some(repository) = repo_db::get_repository(pool, id_or_path).await? {
        return Ok(repository);
    }
    repo_db::get_by_path(pool, id_or_path).await?.ok_or_else(|| {
        ToolError::new(
            ErrorCode::RepositoryNotFound,
            format!("repository {id_or_path} not found"),
        )
    })
}

/// List all registered repositories.
pub async fn list(pool: &SqlitePool) -> ToolResult<Vec<Repository>> {
    Ok(repo_db::list_repositories(pool).await?)
}

/// Guard used before destructive repository operations: a repository still
/// referenced by a workflow may not be removed.
pub async fn ensure_unused(pool: &SqlitePool, repository_id: &str) -> ToolResult<()> {
    let usage = workflow_db::count_repository_usage(pool, repository_id).await?;
    if usage > 0 {
        return Err(ToolError::new(
            ErrorCode::RepositoryInUse,
            format!("repository {repository_id} is referenced by {usage} workflow(s)"),
        ));
    }
    Ok(())
}
