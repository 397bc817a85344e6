//! Workflow spawner: owns one agent pool and a polling loop, and drives a
//! workflow from `ready` to a terminal state.

pub mod events;
pub mod launcher;
pub mod pool;
pub mod registry;
pub mod routing;
pub mod runner;
pub mod stagnation;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use caw_db::models::{AgentRole, AgentRuntime, MessageType, TaskStatus, Workflow, WorkflowStatus};
use caw_db::now_ms;
use caw_db::queries::messages as message_db;
use caw_db::queries::tasks as task_db;
use caw_db::queries::workflows as workflow_db;
use caw_db::queries::workspaces as workspace_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::orchestration;
use crate::services::{agent as agent_service, lock as lock_service};
use crate::state::{TaskStateMachine, WorkflowStateMachine};

use events::{EventListeners, SpawnerEvent};
use launcher::{AgentLauncher, PermissionMode};
use pool::{AgentPool, PoolConfig};
use stagnation::StagnationConfig;

/// How often the poll loop wakes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Runtime options for a spawner.
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Pool cap; defaults to `workflow.max_parallel_tasks`.
    pub max_agents: Option<usize>,
    pub permission_mode: PermissionMode,
    pub ephemeral_worktree: bool,
    pub mcp_port: u16,
    pub poll_interval: Duration,
    pub stagnation: StagnationConfig,
}

impl SpawnerConfig {
    pub fn new(mcp_port: u16) -> Self {
        Self {
            max_agents: None,
            permission_mode: PermissionMode::CawToolsOnly,
            ephemeral_worktree: false,
            mcp_port,
            poll_interval: POLL_INTERVAL,
            stagnation: StagnationConfig::default(),
        }
    }
}

/// The slice of spawner state persisted into `workflow.config` so a
/// restarted daemon can resume the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedSpawner {
    pub max_agents: usize,
    pub ephemeral_worktree: bool,
    pub bypass_permissions: bool,
    pub started_at: i64,
    #[serde(default)]
    pub suspended_at: Option<i64>,
}

/// Snapshot returned by [`WorkflowSpawner::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct SpawnerStatus {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub agents: Vec<String>,
    pub progress: orchestration::Progress,
    pub started_at: Option<i64>,
    pub suspended_at: Option<i64>,
}

/// Drives one workflow.
pub struct WorkflowSpawner {
    db: SqlitePool,
    workflow_id: String,
    config: SpawnerConfig,
    listeners: Arc<EventListeners>,
    agent_pool: Arc<AgentPool>,
    poll_cancel: StdMutex<Option<CancellationToken>>,
    human_agent_id: StdMutex<Option<String>>,
    queried_tasks: StdMutex<HashSet<String>>,
    started_at: StdMutex<Option<i64>>,
    suspended_at: StdMutex<Option<i64>>,
    finished: AtomicBool,
}

impl WorkflowSpawner {
    pub fn new(
        db: SqlitePool,
        workflow_id: String,
        launcher: Arc<dyn AgentLauncher>,
        config: SpawnerConfig,
        max_parallel_tasks: i64,
    ) -> Arc<Self> {
        let listeners = Arc::new(EventListeners::new());
        let max_agents = config.max_agents.unwrap_or(max_parallel_tasks.max(1) as usize);

        let agent_pool = Arc::new(AgentPool::new(
            db.clone(),
            workflow_id.clone(),
            launcher,
            Arc::clone(&listeners),
            PoolConfig {
                max_agents,
                permission_mode: config.permission_mode,
                ephemeral_worktree: config.ephemeral_worktree,
                mcp_port: config.mcp_port,
                heartbeat_interval: Duration::from_secs(15),
                stagnation: config.stagnation.clone(),
            },
        ));

        Arc::new(Self {
            db,
            workflow_id,
            config,
            listeners,
            agent_pool,
            poll_cancel: StdMutex::new(None),
            human_agent_id: StdMutex::new(None),
            queried_tasks: StdMutex::new(HashSet::new()),
            started_at: StdMutex::new(None),
            suspended_at: StdMutex::new(None),
            finished: AtomicBool::new(false),
        })
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn listeners(&self) -> &Arc<EventListeners> {
        &self.listeners
    }

    pub fn is_running(&self) -> bool {
        let guard = self.poll_cancel.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_ref().is_some_and(|token| !token.is_cancelled())
    }

    /// Whether the run reached a terminal classification.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn workflow(&self) -> ToolResult<Workflow> {
        crate::services::require_workflow(&self.db, &self.workflow_id).await
    }

    /// Start execution: clean up stale agents, transition the workflow to
    /// `in_progress`, register the operator pseudo-agent, persist spawner
    /// metadata, and open the poll loop.
    pub async fn start(self: &Arc<Self>) -> ToolResult<()> {
        if self.is_running() {
            return Err(ToolError::new(
                ErrorCode::AlreadyRunning,
                format!("workflow {} is already being executed", self.workflow_id),
            ));
        }

        let workflow = self.workflow().await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Ready | WorkflowStatus::InProgress | WorkflowStatus::Paused
        ) {
            return Err(ToolError::new(
                ErrorCode::InvalidState,
                format!(
                    "workflow {} has status {}, expected ready, in_progress, or paused",
                    self.workflow_id, workflow.status
                ),
            ));
        }

        // Stale-agent cleanup: any agent row left over from a dead run
        // loses its claims, and its tasks go back to pending.
        let leftovers =
            agent_service::list(&self.db, Some(&self.workflow_id), None).await?;
        for agent in leftovers.iter().filter(|a| a.status != caw_db::models::AgentStatus::Offline) {
            let released = task_db::release_tasks_for_agent(&self.db, &agent.id).await?;
            if released > 0 {
                info!(agent_id = %agent.id, released, "released tasks of stale agent");
            }
            let _ = agent_service::unregister(&self.db, &agent.id).await;
        }

        if workflow.status != WorkflowStatus::InProgress {
            WorkflowStateMachine::transition(
                &self.db,
                &self.workflow_id,
                workflow.status,
                WorkflowStatus::InProgress,
            )
            .await?;
        }

        // The operator's inbox for agent queries.
        let human = agent_service::register(
            &self.db,
            &agent_service::RegisterAgent {
                name: "human",
                runtime: AgentRuntime::Human,
                role: AgentRole::Coordinator,
                capabilities: None,
                workflow_id: Some(&self.workflow_id),
                workspace_path: None,
                metadata: None,
            },
        )
        .await?;
        *self.human_agent_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(human.id);

        let started = now_ms();
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(started);
        self.persist_config(Some(started), None).await?;

        self.agent_pool.open();

        let token = CancellationToken::new();
        *self.poll_cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let spawner = Arc::clone(self);
        tokio::spawn(async move {
            spawner.poll_loop(token).await;
        });

        info!(workflow_id = %self.workflow_id, "spawner started");
        Ok(())
    }

    /// Stop polling, abort every session, pause all in-flight tasks, and
    /// move the workflow to `paused`. Returns how many agents were stopped.
    pub async fn suspend(&self) -> ToolResult<usize> {
        if !self.is_running() {
            return Err(ToolError::new(
                ErrorCode::NotRunning,
                format!("workflow {} is not being executed", self.workflow_id),
            ));
        }
        self.stop_polling();
        let agents_stopped = self.agent_pool.abort_all();
        self.agent_pool.close();

        let in_flight =
            task_db::list_tasks_in_status(&self.db, &self.workflow_id, TaskStatus::InProgress)
                .await?;
        for task in &in_flight {
            if let Err(e) = TaskStateMachine::transition(
                &self.db,
                &task.id,
                TaskStatus::InProgress,
                TaskStatus::Paused,
            )
            .await
            {
                warn!(task_id = %task.id, error = %e, "failed to pause task on suspend");
            }
        }

        let workflow = self.workflow().await?;
        if workflow.status == WorkflowStatus::InProgress {
            WorkflowStateMachine::transition(
                &self.db,
                &self.workflow_id,
                WorkflowStatus::InProgress,
                WorkflowStatus::Paused,
            )
            .await?;
        }

        let suspended = now_ms();
        *self.suspended_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(suspended);
        let started = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_config(started, Some(suspended)).await?;

        info!(workflow_id = %self.workflow_id, agents_stopped, "spawner suspended");
        Ok(agents_stopped)
    }

    /// Resume a suspended workflow: paused tasks go back to `in_progress`
    /// with their assignment cleared, and the poll loop restarts.
    pub async fn resume(self: &Arc<Self>) -> ToolResult<()> {
        let workflow = self.workflow().await?;
        if workflow.status != WorkflowStatus::Paused {
            return Err(ToolError::new(
                ErrorCode::NotSuspended,
                format!(
                    "workflow {} has status {}, expected paused",
                    self.workflow_id, workflow.status
                ),
            ));
        }

        WorkflowStateMachine::transition(
            &self.db,
            &self.workflow_id,
            WorkflowStatus::Paused,
            WorkflowStatus::InProgress,
        )
        .await?;

        let paused =
            task_db::list_tasks_in_status(&self.db, &self.workflow_id, TaskStatus::Paused).await?;
        for task in &paused {
            TaskStateMachine::transition(&self.db, &task.id, TaskStatus::Paused, TaskStatus::InProgress)
                .await?;
            task_db::clear_assignment(&self.db, &task.id).await?;
        }

        self.queried_tasks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.suspended_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let started = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_config(started, None).await?;

        self.agent_pool.open();
        let token = CancellationToken::new();
        *self.poll_cancel.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        let spawner = Arc::clone(self);
        tokio::spawn(async move {
            spawner.poll_loop(token).await;
        });

        info!(workflow_id = %self.workflow_id, resumed_tasks = paused.len(), "spawner resumed");
        Ok(())
    }

    /// Stop polling, abort sessions, and best-effort remove active
    /// worktrees (skipped while the workflow awaits external merges).
    pub async fn shutdown(&self) {
        self.stop_polling();
        self.agent_pool.abort_all();
        self.agent_pool.close();

        let awaiting_merge = matches!(
            self.workflow().await.map(|w| w.status),
            Ok(WorkflowStatus::AwaitingMerge)
        );
        if !awaiting_merge {
            if let Ok(workspaces) = workspace_db::list_workspaces(
                &self.db,
                Some(&self.workflow_id),
                Some(caw_db::models::WorkspaceStatus::Active),
            )
            .await
            {
                for workspace in &workspaces {
                    if crate::worktree::discard_path(&workspace.path) {
                        let _ = workspace_db::update_workspace(
                            &self.db,
                            &workspace.id,
                            &workspace_db::WorkspaceUpdate {
                                status: Some(caw_db::models::WorkspaceStatus::Abandoned),
                                ..Default::default()
                            },
                        )
                        .await;
                    } else {
                        warn!(path = %workspace.path, "worktree cleanup failed");
                    }
                }
            }
        }

        info!(workflow_id = %self.workflow_id, "spawner shut down");
    }

    /// Snapshot for `workflow_execution_status`.
    pub async fn get_status(&self) -> ToolResult<SpawnerStatus> {
        let workflow = self.workflow().await?;
        let progress = orchestration::get_progress(&self.db, &self.workflow_id).await?;
        Ok(SpawnerStatus {
            workflow_id: self.workflow_id.clone(),
            status: workflow.status,
            agents: self.agent_pool.active_task_ids(),
            progress,
            started_at: *self.started_at.lock().unwrap_or_else(|e| e.into_inner()),
            suspended_at: *self.suspended_at.lock().unwrap_or_else(|e| e.into_inner()),
        })
    }

    /// Update the pool cap and persist both it and the workflow's
    /// parallelism setting.
    pub async fn set_max_agents(&self, n: usize) -> ToolResult<()> {
        if n < 1 {
            return Err(ToolError::new(ErrorCode::InvalidInput, "max_agents must be at least 1"));
        }
        self.agent_pool.set_max_agents(n);
        workflow_db::set_parallelism(&self.db, &self.workflow_id, n as i64).await?;
        let started = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        let suspended = *self.suspended_at.lock().unwrap_or_else(|e| e.into_inner());
        self.persist_config(started, suspended).await?;
        Ok(())
    }

    fn stop_polling(&self) {
        let mut guard = self.poll_cancel.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    /// Merge the spawner's metadata into `workflow.config` so resume can
    /// reconstruct it.
    async fn persist_config(&self, started_at: Option<i64>, suspended_at: Option<i64>) -> ToolResult<()> {
        let workflow = self.workflow().await?;
        let mut config: serde_json::Value = workflow
            .config
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok())
            .unwrap_or_else(|| serde_json::json!({}));

        let persisted = PersistedSpawner {
            max_agents: self.agent_pool.max_agents(),
            ephemeral_worktree: self.config.ephemeral_worktree,
            bypass_permissions: self.config.permission_mode == PermissionMode::BypassPermissions,
            started_at: started_at.unwrap_or_else(now_ms),
            suspended_at,
        };
        config["spawner"] = serde_json::to_value(&persisted).map_err(ToolError::internal)?;

        let serialized = serde_json::to_string(&config).map_err(ToolError::internal)?;
        workflow_db::set_config(&self.db, &self.workflow_id, Some(&serialized)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Poll loop
    // -----------------------------------------------------------------------

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(true) => {
                    self.finished.store(true, Ordering::SeqCst);
                    self.stop_polling();
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(workflow_id = %self.workflow_id, error = %e, "poll tick failed");
                }
            }
        }
    }

    /// One poll iteration. Returns `true` when the run reached a terminal
    /// state and polling should stop.
    async fn tick(self: &Arc<Self>) -> ToolResult<bool> {
        let next = orchestration::get_next_tasks(&self.db, &self.workflow_id, true).await?;

        // 1. Everything terminal: classify completion.
        if next.all_complete {
            return self.classify_completion().await.map(|_| true);
        }

        // 2. Surface agent queries on paused tasks (once per task).
        self.detect_queries().await?;

        // 3. Resume tasks whose question was answered.
        self.resume_answered().await?;

        // 4. Stall detection.
        let progress = orchestration::get_progress(&self.db, &self.workflow_id).await?;
        let nothing_running = self.agent_pool.active_count() == 0
            && progress.by_status.in_progress == 0
            && progress.by_status.planning == 0
            && progress.by_status.paused == 0;
        if nothing_running && next.tasks.is_empty() {
            self.listeners.emit(&SpawnerEvent::WorkflowStalled {
                workflow_id: self.workflow_id.clone(),
                reason: "no runnable tasks, no active agents, and work remains".to_string(),
            });
            return Ok(true);
        }

        // 5. Spawn up to capacity. Orphaned in-flight tasks (assignment
        // cleared by resume or stale-agent cleanup) go first, then the
        // scheduler's picks.
        let workflow = self.workflow().await?;
        let active = self.agent_pool.active_task_ids();
        let orphaned =
            task_db::list_tasks_in_status(&self.db, &self.workflow_id, TaskStatus::InProgress)
                .await?
                .into_iter()
                .filter(|t| t.assigned_agent_id.is_none())
                .collect::<Vec<_>>();
        let candidates: Vec<_> = orphaned
            .iter()
            .chain(next.tasks.iter())
            .filter(|t| !active.contains(&t.id))
            .collect();

        let mut spawnable = 0;
        for task in &candidates {
            if self.agent_pool.is_exhausted(&task.id) {
                continue;
            }
            spawnable += 1;
            if !self.agent_pool.has_capacity() {
                break;
            }
            if let Err(e) = self.agent_pool.spawn_for_task(&workflow, task).await {
                warn!(task_id = %task.id, error = %e, "failed to spawn agent for task");
            }
        }

        // Every remaining candidate is permanently failed and nothing is
        // running: the workflow cannot make progress.
        if spawnable == 0 && !candidates.is_empty() && self.agent_pool.active_count() == 0 {
            let error = "one or more tasks failed permanently".to_string();
            let workflow = self.workflow().await?;
            if !workflow.status.is_terminal() {
                let _ = WorkflowStateMachine::transition(
                    &self.db,
                    &self.workflow_id,
                    workflow.status,
                    WorkflowStatus::Failed,
                )
                .await;
            }
            self.listeners.emit(&SpawnerEvent::WorkflowFailed {
                workflow_id: self.workflow_id.clone(),
                error,
            });
            return Ok(true);
        }

        Ok(false)
    }

    /// Emit `agent_query` for paused tasks with unread operator-bound
    /// queries, once per task.
    async fn detect_queries(&self) -> ToolResult<()> {
        let human_id = self
            .human_agent_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let Some(human_id) = human_id else {
            return Ok(());
        };

        let paused =
            task_db::list_tasks_in_status(&self.db, &self.workflow_id, TaskStatus::Paused).await?;
        for task in paused.iter().filter(|t| t.assigned_agent_id.is_some()) {
            {
                let queried = self.queried_tasks.lock().unwrap_or_else(|e| e.into_inner());
                if queried.contains(&task.id) {
                    continue;
                }
            }
            let queries = message_db::list_messages(
                &self.db,
                &human_id,
                &message_db::MessageFilter {
                    status: Some(caw_db::models::MessageStatus::Unread),
                    message_type: Some(MessageType::Query),
                    task_id: Some(task.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

            if let Some(first) = queries.first() {
                self.queried_tasks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(task.id.clone());
                self.listeners.emit(&SpawnerEvent::AgentQuery {
                    workflow_id: self.workflow_id.clone(),
                    task_id: task.id.clone(),
                    message_id: first.id.clone(),
                });
            }
        }
        Ok(())
    }

    /// Move answered paused tasks back to `in_progress` and spawn a fresh
    /// agent for each.
    async fn resume_answered(self: &Arc<Self>) -> ToolResult<()> {
        let paused =
            task_db::list_tasks_in_status(&self.db, &self.workflow_id, TaskStatus::Paused).await?;
        if paused.is_empty() {
            return Ok(());
        }
        let workflow = self.workflow().await?;

        for task in &paused {
            let answers =
                message_db::list_unread_for_task(&self.db, &task.id, MessageType::Response).await?;
            if answers.is_empty() {
                continue;
            }
            for answer in &answers {
                message_db::mark_read(&self.db, &answer.id).await?;
            }

            // The session that asked the question is replaced wholesale; a
            // fresh spawn picks the cached LLM session up via --resume.
            self.agent_pool.abort_task(&task.id);

            TaskStateMachine::transition(&self.db, &task.id, TaskStatus::Paused, TaskStatus::InProgress)
                .await?;
            task_db::clear_assignment(&self.db, &task.id).await?;
            self.queried_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task.id);

            let refreshed = crate::services::require_task(&self.db, &task.id).await?;
            if let Err(e) = self.agent_pool.spawn_for_task(&workflow, &refreshed).await {
                warn!(task_id = %task.id, error = %e, "failed to respawn answered task");
            }
        }
        Ok(())
    }

    /// All tasks terminal: decide between `completed` and `awaiting_merge`.
    async fn classify_completion(&self) -> ToolResult<()> {
        let with_prs = workspace_db::list_with_pr_urls(&self.db, &self.workflow_id).await?;
        let workflow = self.workflow().await?;

        if with_prs.is_empty() {
            if workflow.status == WorkflowStatus::InProgress {
                WorkflowStateMachine::transition(
                    &self.db,
                    &self.workflow_id,
                    WorkflowStatus::InProgress,
                    WorkflowStatus::Completed,
                )
                .await?;
            }
            self.listeners.emit(&SpawnerEvent::WorkflowAllComplete {
                workflow_id: self.workflow_id.clone(),
            });
        } else {
            let pr_urls: Vec<String> =
                with_prs.iter().filter_map(|w| w.pr_url.clone()).collect();
            if workflow.status == WorkflowStatus::InProgress {
                WorkflowStateMachine::transition(
                    &self.db,
                    &self.workflow_id,
                    WorkflowStatus::InProgress,
                    WorkflowStatus::AwaitingMerge,
                )
                .await?;
            }
            self.listeners.emit(&SpawnerEvent::WorkflowAwaitingMerge {
                workflow_id: self.workflow_id.clone(),
                pr_urls,
            });
        }

        // Locks held for the run are meaningless once it is over.
        let _ = lock_service::release_stale_workflow_locks(&self.db, lock_service::STALE_SESSION_MS)
            .await;
        Ok(())
    }
}
