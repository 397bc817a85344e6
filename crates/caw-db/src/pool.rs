//! SQLite pool construction, path resolution, and the migration runner.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::info;

use crate::migrations::MIGRATIONS;

/// Where the database file lives.
///
/// `Repository` mode keeps one database per repository under
/// `<repo>/.caw/caw.db`; `Global` mode keeps a single shared database under
/// the user data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbMode {
    Global,
    Repository,
}

/// Resolve the database file path from the daemon's environment knobs.
///
/// An explicit `db_path` wins. Otherwise `Repository` mode resolves against
/// `repo_path` (or the current directory), and `Global` mode resolves under
/// the platform data dir.
pub fn resolve_db_path(
    mode: DbMode,
    repo_path: Option<&Path>,
    db_path: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(explicit) = db_path {
        return Ok(explicit.to_path_buf());
    }

    match mode {
        DbMode::Repository => {
            let base = match repo_path {
                Some(p) => p.to_path_buf(),
                None => std::env::current_dir().context("could not determine current directory")?,
            };
            Ok(base.join(".caw").join("caw.db"))
        }
        DbMode::Global => {
            let base = dirs::data_local_dir()
                .context("could not determine platform data directory for global db mode")?;
            Ok(base.join("caw").join("caw.db"))
        }
    }
}

/// Open (creating if necessary) the database at `path` and apply migrations.
///
/// WAL mode gives concurrent readers under the single writer; the busy
/// timeout covers the brief write-lock contention between the daemon and
/// client processes sharing the file.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
        .with_context(|| format!("invalid database path {}", path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Apply all pending migrations.
///
/// The `schema_version` table holds a single row counting applied scripts.
/// Each pending script runs in its own transaction together with the
/// version bump, so a crash mid-migration leaves the version consistent.
/// Safe to call from every process that opens the database.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await
        .context("failed to create schema_version table")?;

    let current: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .context("failed to read schema version")?;

    let mut version = match current {
        Some((v,)) => v,
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (0)")
                .execute(pool)
                .await
                .context("failed to seed schema_version row")?;
            0
        }
    };

    while (version as usize) < MIGRATIONS.len() {
        let script = MIGRATIONS[version as usize];
        let mut tx = pool.begin().await.context("failed to begin migration transaction")?;

        for statement in script.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {} failed", version + 1))?;
        }

        sqlx::query("UPDATE schema_version SET version = ?")
            .bind(version + 1)
            .execute(&mut *tx)
            .await
            .context("failed to bump schema version")?;

        tx.commit().await.context("failed to commit migration")?;
        version += 1;
        info!(version, "applied schema migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_file_and_applies_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("caw.db");
        let pool = open_pool(&db_path).await.expect("open_pool failed");

        assert!(db_path.exists());

        let (version,): (i64,) = sqlx::query_as("SELECT version FROM schema_version")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version as usize, MIGRATIONS.len());
        pool.close().await;
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("caw.db");

        let pool = open_pool(&db_path).await.unwrap();
        // Re-run against the same database; no-op, no error.
        run_migrations(&pool).await.expect("second run should be a no-op");
        pool.close().await;

        // Re-open the same file.
        let pool = open_pool(&db_path).await.expect("re-open failed");
        pool.close().await;
    }

    #[test]
    fn resolve_repository_mode_uses_repo_path() {
        let path = resolve_db_path(
            DbMode::Repository,
            Some(Path::new("/srv/project")),
            None,
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/srv/project/.caw/caw.db"));
    }

    #[test]
    fn resolve_explicit_path_wins() {
        let path = resolve_db_path(
            DbMode::Global,
            Some(Path::new("/srv/project")),
            Some(Path::new("/tmp/other.db")),
        )
        .unwrap();
        assert_eq!(path, PathBuf::from("/tmp/other.db"));
    }
}
