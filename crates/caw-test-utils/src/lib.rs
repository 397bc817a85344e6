//! Shared test utilities for caw integration tests.
//!
//! Each test gets its own SQLite database file in a fresh temp directory
//! with all migrations applied. Hold the returned [`TestDb`] for the whole
//! test; dropping it removes the directory.

use sqlx::SqlitePool;
use tempfile::TempDir;

use caw_db::pool::open_pool;

/// A migrated scratch database. The temp directory lives as long as this
/// struct does.
pub struct TestDb {
    pub pool: SqlitePool,
    pub dir: TempDir,
}

impl TestDb {
    /// Path to the database file (for lock-file-sibling tests).
    pub fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("caw.db")
    }
}

/// Create a temporary database with migrations applied.
pub async fn create_test_db() -> TestDb {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("caw.db");
    let pool = open_pool(&db_path)
        .await
        .expect("failed to open test database");
    TestDb { pool, dir }
}
