//! Query functions for the `repositories` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Repository;
use crate::{ids, now_ms};

/// Register a repository path, idempotently.
///
/// The same path always resolves to the same row; a repeated registration
/// may refresh the friendly name.
pub async fn register_repository(
    pool: &SqlitePool,
    path: &str,
    name: Option<&str>,
) -> Result<Repository> {
    let id = ids::generate(ids::prefix::REPOSITORY);
    let now = now_ms();

    let repository = sqlx::query_as::<_, Repository>(
        "INSERT INTO repositories (id, path, name, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT (path) DO UPDATE SET \
             name = COALESCE(excluded.name, repositories.name), \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(&id)
    .bind(path)
    .bind(name)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .context("failed to register repository")?;

    Ok(repository)
}

/// Fetch a single repository by id.
pub async fn get_repository(pool: &SqlitePool, id: &str) -> Result<Option<Repository>> {
    let repository = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch repository")?;

    Ok(repository)
}

/// Fetch a repository by its canonical path.
pub async fn get_by_path(pool: &SqlitePool, path: &str) -> Result<Option<Repository>> {
    let repository = sqlx::query_as::<_, Repository>("SELECT * FROM repositories WHERE path = ?")
        .bind(path)
        .fetch_optional(pool)
        .await
        .context("failed to fetch repository by path")?;

    Ok(repository)
}

/// List all repositories ordered by path.
pub async fn list_repositories(pool: &SqlitePool) -> Result<Vec<Repository>> {
    let repositories =
        sqlx::query_as::<_, Repository>("SELECT * FROM repositories ORDER BY path ASC")
            .fetch_all(pool)
            .await
            .context("failed to list repositories")?;

    Ok(repositories)
}
