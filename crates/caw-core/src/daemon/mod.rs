//! Daemon lifecycle: one daemon process per database, shared by a pool of
//! client processes, with hot handoff when the daemon dies.

pub mod lockfile;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use caw_db::queries::sessions as session_db;

use crate::rpc::http;
use crate::services::{lock as lock_service, session as session_service};
use crate::spawner::launcher::AgentLauncher;
use crate::spawner::registry::{self, SpawnerRegistry};
use crate::tools::{ToolContext, ToolRegistry};

use lockfile::LockFile;

/// Sessions and locks silent for longer than this are stale.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(60);
/// Daemon/session heartbeat cadence, and the clients' health-poll cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Budget for one `GET /health` probe.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

/// What this process became after startup race resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Daemon,
    Client,
}

/// A started daemon-or-client instance.
pub struct Daemon {
    pub role: Role,
    pub session_id: String,
    pub port: u16,
    db: SqlitePool,
    lock_path: PathBuf,
    registry: Arc<SpawnerRegistry>,
    tools: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    cancel: CancellationToken,
}

/// Probe a daemon's health endpoint.
pub async fn health_ok(port: u16) -> bool {
    let url = format!("http://127.0.0.1:{port}/health");
    let client = match reqwest::Client::builder().timeout(HEALTH_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return false,
    };
    match client.get(&url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Whether a pid names a live process.
#[cfg(unix)]
fn pid_alive(pid: i64) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 probes for existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i64) -> bool {
    false
}

impl Daemon {
    /// Start as daemon or client, resolving the startup race through the
    /// lock file.
    ///
    /// 1. Drop stale workflow locks and sessions.
    /// 2. A live, healthy daemon in the lock file makes us a client.
    /// 3. Otherwise remove the stale file and exclusive-create our own;
    ///    losing that race also makes us a client.
    /// 4. Winning it makes us the daemon: start the HTTP transport, the
    ///    heartbeat, and resume interrupted workflows.
    pub async fn start(
        db: SqlitePool,
        db_path: &Path,
        port: u16,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Result<Daemon> {
        let stale_ms = STALE_TIMEOUT.as_millis() as i64;
        lock_service::release_stale_workflow_locks(&db, stale_ms)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        session_service::cleanup_stale(&db, stale_ms)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let lock_path = lockfile::lock_path(db_path);

        if let Some(existing) = lockfile::read(&lock_path).unwrap_or(None) {
            if existing.shutting_down != Some(true)
                && pid_alive(existing.pid)
                && health_ok(existing.port).await
            {
                info!(daemon_pid = existing.pid, port = existing.port, "joining existing daemon");
                return Self::become_client(db, lock_path, existing, launcher).await;
            }
            // Stale daemon: clear its session row and sentinel file.
            warn!(daemon_pid = existing.pid, "removing stale daemon lock");
            let _ = session_db::delete_session(&db, &existing.session_id).await;
            lockfile::remove_stale(&lock_path)?;
        }

        let session = session_service::register(&db, std::process::id() as i64, true)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;

        let contents = LockFile {
            pid: std::process::id() as i64,
            port,
            session_id: session.id.clone(),
            shutting_down: None,
        };

        if !lockfile::try_create(&lock_path, &contents)? {
            // Someone beat us to it; fall back to client.
            let _ = session_db::delete_session(&db, &session.id).await;
            let existing = lockfile::read(&lock_path)?
                .context("lock file vanished during startup race")?;
            return Self::become_client(db, lock_path, existing, launcher).await;
        }

        let daemon = Self::build(db, lock_path, Role::Daemon, session.id, port, launcher);
        daemon.start_daemon_tasks().await?;
        Ok(daemon)
    }

    async fn become_client(
        db: SqlitePool,
        lock_path: PathBuf,
        daemon_lock: LockFile,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Result<Daemon> {
        let session = session_service::register(&db, std::process::id() as i64, false)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let client = Self::build(
            db,
            lock_path,
            Role::Client,
            session.id,
            daemon_lock.port,
            launcher,
        );
        client.start_client_tasks();
        Ok(client)
    }

    fn build(
        db: SqlitePool,
        lock_path: PathBuf,
        role: Role,
        session_id: String,
        port: u16,
        launcher: Arc<dyn AgentLauncher>,
    ) -> Daemon {
        let registry = Arc::new(SpawnerRegistry::new());
        let ctx = Arc::new(ToolContext {
            db: db.clone(),
            registry: Arc::clone(&registry),
            launcher,
            mcp_port: port,
        });
        Daemon {
            role,
            session_id,
            port,
            db,
            lock_path,
            registry,
            tools: Arc::new(ToolRegistry::new()),
            ctx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    pub fn context(&self) -> Arc<ToolContext> {
        Arc::clone(&self.ctx)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Daemon role: HTTP transport, heartbeat loop, workflow resume.
    async fn start_daemon_tasks(&self) -> Result<()> {
        let tools = Arc::clone(&self.tools);
        let ctx = Arc::clone(&self.ctx);
        let port = self.port;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = http::run_http(tools, ctx, port, cancel).await {
                warn!(error = %e, "http transport exited with error");
            }
        });

        self.spawn_heartbeat();

        // Re-attach to in-progress workflows; failures are reported, not
        // fatal.
        let report = registry::resume_workflows(
            &self.db,
            &self.registry,
            Arc::clone(&self.ctx.launcher),
            self.port,
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
        if !report.resumed.is_empty() || !report.skipped.is_empty() {
            info!(
                resumed = report.resumed.len(),
                skipped = report.skipped.len(),
                "workflow resume report"
            );
        }

        info!(session_id = %self.session_id, port = self.port, "daemon started");
        Ok(())
    }

    /// Client role: heartbeat plus daemon health monitoring with
    /// promotion on failure.
    fn start_client_tasks(&self) {
        self.spawn_heartbeat();

        let db = self.db.clone();
        let lock_path = self.lock_path.clone();
        let session_id = self.session_id.clone();
        let port = self.port;
        let tools = Arc::clone(&self.tools);
        let ctx = Arc::clone(&self.ctx);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if health_ok(port).await {
                    continue;
                }

                warn!("daemon health check failed, attempting promotion");
                if let Ok(Some(stale)) = lockfile::read(&lock_path) {
                    let _ = session_db::delete_session(&db, &stale.session_id).await;
                    let _ = lockfile::remove_stale(&lock_path);
                }

                let contents = LockFile {
                    pid: std::process::id() as i64,
                    port,
                    session_id: session_id.clone(),
                    shutting_down: None,
                };
                match lockfile::try_create(&lock_path, &contents) {
                    Ok(true) => {
                        info!(session_id = %session_id, "promoted to daemon");
                        let _ = session_db::promote_to_daemon(&db, &session_id).await;
                        let http_cancel = cancel.clone();
                        let tools = Arc::clone(&tools);
                        let ctx = Arc::clone(&ctx);
                        tokio::spawn(async move {
                            if let Err(e) = http::run_http(tools, ctx, port, http_cancel).await {
                                warn!(error = %e, "promoted http transport exited with error");
                            }
                        });
                        return;
                    }
                    Ok(false) => {
                        // Another client won; keep monitoring the new daemon.
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "promotion attempt failed");
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self) {
        let db = self.db.clone();
        let session_id = self.session_id.clone();
        let cancel = self.cancel.clone();
        let is_daemon = self.role == Role::Daemon;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if let Err(e) = session_service::heartbeat(&db, &session_id).await {
                    warn!(error = %e, "session heartbeat failed");
                }
                if is_daemon {
                    let stale_ms = STALE_TIMEOUT.as_millis() as i64;
                    let _ = lock_service::release_stale_workflow_locks(&db, stale_ms).await;
                }
            }
        });
    }

    /// Orderly exit: stop background work, close spawners, deregister the
    /// session, and unlink the lock file iff we still own it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.registry.shutdown_all().await;
        let _ = session_service::deregister(&self.db, &self.session_id).await;
        match lockfile::remove_if_owner(&self.lock_path, &self.session_id) {
            Ok(true) => info!("lock file removed"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to remove lock file"),
        }
        info!(session_id = %self.session_id, "shutdown complete");
    }
}
