//! The daemon lock file: a filesystem sentinel identifying the current
//! daemon for a database.
//!
//! The file sits next to the database, is created with exclusive-create
//! semantics, and is removed only by the session that owns it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE_NAME: &str = "server.lock";

/// The lock file's JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockFile {
    pub pid: i64,
    pub port: u16,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutting_down: Option<bool>,
}

/// The lock file path for a database file.
pub fn lock_path(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(parent) => parent.join(LOCK_FILE_NAME),
        None => PathBuf::from(LOCK_FILE_NAME),
    }
}

/// Read and parse the lock file. `Ok(None)` when it does not exist;
/// unreadable or unparseable contents are reported as errors so callers
/// can decide whether to treat the file as stale.
pub fn read(path: &Path) -> Result<Option<LockFile>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let parsed = serde_json::from_str(&raw)
        .with_context(|| format!("malformed lock file at {}", path.display()))?;
    Ok(Some(parsed))
}

/// Try to create the lock file with exclusive-create semantics.
///
/// Returns `Ok(true)` when this process won the race, `Ok(false)` when
/// the file already exists.
pub fn try_create(path: &Path, contents: &LockFile) -> Result<bool> {
    use std::io::Write;

    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path);

    let mut file = match file {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(false),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to create {}", path.display()));
        }
    };

    let body = serde_json::to_string(contents).context("failed to serialise lock file")?;
    file.write_all(body.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(true)
}

/// Unlink the lock file, but only when `session_id` still owns it.
pub fn remove_if_owner(path: &Path, session_id: &str) -> Result<bool> {
    match read(path)? {
        Some(lock) if lock.session_id == session_id => {
            std::fs::remove_file(path)
                .with_context(|| format!("failed to remove {}", path.display()))?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Unconditionally unlink a lock file known to be stale.
pub fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove stale {}", path.display())),
    }
}
