//! Query functions for the `templates` table.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::models::Template;
use crate::{ids, now_ms};

/// Insert a template. The name is unique; the caller maps the constraint
/// violation to `DUPLICATE_TEMPLATE`.
pub async fn insert_template(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    tasks_json: &str,
    variables_json: &str,
) -> Result<Template> {
    let id = ids::generate(ids::prefix::TEMPLATE);

    let template = sqlx::query_as::<_, Template>(
        "INSERT INTO templates (id, name, description, tasks, variables, created_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         RETURNING *",
    )
    .bind(&id)
    .bind(name)
    .bind(description)
    .bind(tasks_json)
    .bind(variables_json)
    .bind(now_ms())
    .fetch_one(pool)
    .await
    .context("failed to insert template")?;

    Ok(template)
}

/// Fetch a single template by id.
pub async fn get_template(pool: &SqlitePool, id: &str) -> Result<Option<Template>> {
    let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch template")?;

    Ok(template)
}

/// Fetch a template by its unique name.
pub async fn get_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Template>> {
    let template = sqlx::query_as::<_, Template>("SELECT * FROM templates WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch template by name")?;

    Ok(template)
}

/// List all templates ordered by name.
pub async fn list_templates(pool: &SqlitePool) -> Result<Vec<Template>> {
    let templates = sqlx::query_as::<_, Template>("SELECT * FROM templates ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list templates")?;

    Ok(templates)
}
