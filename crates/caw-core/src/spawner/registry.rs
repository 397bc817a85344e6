//! Process-wide registry of active spawners, and resume-on-start.
//!
//! One spawner per workflow per process; the registry is owned by the
//! daemon and passed explicitly to the tool surface (no global state).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use caw_db::models::WorkflowStatus;
use caw_db::queries::workflows as workflow_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::spawner::launcher::{AgentLauncher, PermissionMode};
use crate::spawner::runner::{self, RunnerOptions};
use crate::spawner::{PersistedSpawner, SpawnerConfig, WorkflowSpawner};

/// `workflow_id -> spawner` map for one daemon process.
#[derive(Default)]
pub struct SpawnerRegistry {
    spawners: StdMutex<HashMap<String, Arc<WorkflowSpawner>>>,
}

impl SpawnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a spawner. Fails with `ALREADY_RUNNING` when the workflow
    /// already has one in this process.
    pub fn register(&self, spawner: Arc<WorkflowSpawner>) -> ToolResult<()> {
        let mut spawners = self.spawners.lock().unwrap_or_else(|e| e.into_inner());
        let workflow_id = spawner.workflow_id().to_string();
        if spawners.contains_key(&workflow_id) {
            return Err(ToolError::new(
                ErrorCode::AlreadyRunning,
                format!("workflow {workflow_id} already has an active spawner"),
            ));
        }
        spawners.insert(workflow_id, spawner);
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Option<Arc<WorkflowSpawner>> {
        self.spawners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(workflow_id)
            .cloned()
    }

    pub fn remove(&self, workflow_id: &str) -> Option<Arc<WorkflowSpawner>> {
        self.spawners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(workflow_id)
    }

    pub fn list(&self) -> Vec<String> {
        self.spawners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Shut every spawner down (daemon exit).
    pub async fn shutdown_all(&self) {
        let spawners: Vec<Arc<WorkflowSpawner>> = {
            let mut guard = self.spawners.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain().map(|(_, s)| s).collect()
        };
        for spawner in spawners {
            spawner.shutdown().await;
        }
    }
}

/// Outcome of [`resume_workflows`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResumeReport {
    pub resumed: Vec<String>,
    /// `(workflow_id, reason)` pairs for workflows that could not resume.
    pub skipped: Vec<(String, String)>,
}

/// Re-attach to every `in_progress` workflow after a daemon restart.
///
/// Each workflow's spawner config is reconstructed from the metadata the
/// previous spawner persisted into `workflow.config`; workflows without it
/// are reported as skipped. Runs are detached (non-blocking).
pub async fn resume_workflows(
    db: &SqlitePool,
    registry: &Arc<SpawnerRegistry>,
    launcher: Arc<dyn AgentLauncher>,
    mcp_port: u16,
) -> ToolResult<ResumeReport> {
    let mut report = ResumeReport::default();

    let in_progress = workflow_db::list_workflows(db, Some(WorkflowStatus::InProgress)).await?;
    for workflow in in_progress {
        if registry.get(&workflow.id).is_some() {
            continue;
        }

        let persisted: Option<PersistedSpawner> = workflow
            .config
            .as_deref()
            .and_then(|c| serde_json::from_str::<serde_json::Value>(c).ok())
            .and_then(|v| serde_json::from_value(v.get("spawner")?.clone()).ok());

        let Some(persisted) = persisted else {
            report.skipped.push((
                workflow.id.clone(),
                "no persisted spawner config".to_string(),
            ));
            continue;
        };

        let config = SpawnerConfig {
            max_agents: Some(persisted.max_agents),
            permission_mode: if persisted.bypass_permissions {
                PermissionMode::BypassPermissions
            } else {
                PermissionMode::CawToolsOnly
            },
            ephemeral_worktree: persisted.ephemeral_worktree,
            ..SpawnerConfig::new(mcp_port)
        };

        let spawner = WorkflowSpawner::new(
            db.clone(),
            workflow.id.clone(),
            Arc::clone(&launcher),
            config,
            workflow.max_parallel_tasks,
        );

        if let Err(e) = registry.register(Arc::clone(&spawner)) {
            report.skipped.push((workflow.id.clone(), e.to_string()));
            continue;
        }

        {
            let registry = Arc::clone(registry);
            let workflow_id = workflow.id.clone();
            spawner.listeners().on_any(move |event| {
                if event.is_terminal() {
                    registry.remove(&workflow_id);
                }
            });
        }

        match runner::run_workflow(
            Arc::clone(&spawner),
            RunnerOptions {
                detach: true,
                ..Default::default()
            },
        )
        .await
        {
            Ok(_) => {
                info!(workflow_id = %workflow.id, "resumed workflow");
                report.resumed.push(workflow.id.clone());
            }
            Err(e) => {
                warn!(workflow_id = %workflow.id, error = %e, "failed to resume workflow");
                registry.remove(&workflow.id);
                report.skipped.push((workflow.id.clone(), e.to_string()));
            }
        }
    }

    Ok(report)
}
