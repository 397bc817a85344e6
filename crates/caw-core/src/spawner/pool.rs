//! Agent pool: the bounded set of live agent sessions for one workflow.
//!
//! The pool registers an Agent row, claims the task, assembles the prompt,
//! applies model routing, spawns the child, and supervises it (heartbeats,
//! stagnation, retry policy, phantom-completion guard) until the stdout
//! stream ends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use caw_db::models::{
    AgentRole, AgentRuntime, Message, Task, TaskStatus, Workflow,
};
use caw_db::queries::agents as agent_db;
use caw_db::queries::messages as message_db;
use caw_db::queries::tasks as task_db;
use caw_db::queries::workflows as workflow_db;
use caw_db::queries::workspaces as workspace_db;

use crate::services::{agent as agent_service, task as task_service};
use crate::worktree::{self, Worktrees};
use crate::spawner::events::{EventListeners, SpawnerEvent};
use crate::spawner::launcher::{AgentLauncher, AgentStreamEvent, PermissionMode, SpawnSpec};
use crate::spawner::routing;
use crate::spawner::stagnation::{EscalationLevel, StagnationConfig, StagnationMonitor};
use crate::state::TaskStateMachine;

/// Per-task retry budget before the pool gives up.
pub const MAX_RETRIES: u32 = 3;

/// Static pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_agents: usize,
    pub permission_mode: PermissionMode,
    /// Pass a named worktree slug to the child instead of resolving a
    /// workspace row.
    pub ephemeral_worktree: bool,
    pub mcp_port: u16,
    pub heartbeat_interval: Duration,
    pub stagnation: StagnationConfig,
}

struct ActiveAgent {
    agent_id: String,
    abort: CancellationToken,
}

/// The per-workflow pool of running agent sessions.
pub struct AgentPool {
    db: SqlitePool,
    workflow_id: String,
    launcher: Arc<dyn AgentLauncher>,
    listeners: Arc<EventListeners>,
    config: PoolConfig,
    max_agents: AtomicUsize,
    open: AtomicBool,
    active: StdMutex<HashMap<String, ActiveAgent>>,
    retries: StdMutex<HashMap<String, u32>>,
    exhausted: StdMutex<HashSet<String>>,
    /// task_id -> LLM session id, for `--resume` spawns.
    session_cache: StdMutex<HashMap<String, String>>,
}

impl AgentPool {
    pub fn new(
        db: SqlitePool,
        workflow_id: String,
        launcher: Arc<dyn AgentLauncher>,
        listeners: Arc<EventListeners>,
        config: PoolConfig,
    ) -> Self {
        let max_agents = config.max_agents.max(1);
        Self {
            db,
            workflow_id,
            launcher,
            listeners,
            config,
            max_agents: AtomicUsize::new(max_agents),
            open: AtomicBool::new(false),
            active: StdMutex::new(HashMap::new()),
            retries: StdMutex::new(HashMap::new()),
            exhausted: StdMutex::new(HashSet::new()),
            session_cache: StdMutex::new(HashMap::new()),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn active_task_ids(&self) -> Vec<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn has_capacity(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self.active_count() < self.max_agents.load(Ordering::SeqCst)
    }

    pub fn max_agents(&self) -> usize {
        self.max_agents.load(Ordering::SeqCst)
    }

    pub fn set_max_agents(&self, n: usize) {
        self.max_agents.store(n.max(1), Ordering::SeqCst);
    }

    /// Whether this task burned through its retry budget.
    pub fn is_exhausted(&self, task_id: &str) -> bool {
        self.exhausted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(task_id)
    }

    /// Abort every active session and drop the bookkeeping entries.
    /// Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let count = active.len();
        for (_, agent) in active.drain() {
            agent.abort.cancel();
        }
        count
    }

    /// Abort the session working one task, if any (Q&A resume replaces the
    /// old session with a fresh one).
    pub fn abort_task(&self, task_id: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.remove(task_id) {
            Some(agent) => {
                agent.abort.cancel();
                true
            }
            None => false,
        }
    }

    /// Register, claim, spawn, and supervise an agent for `task`.
    pub async fn spawn_for_task(self: &Arc<Self>, workflow: &Workflow, task: &Task) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            bail!("pool is closed");
        }
        if self.is_exhausted(&task.id) {
            bail!("task {} has exhausted its retry budget", task.id);
        }
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(&task.id) {
                bail!("task {} already has an active agent", task.id);
            }
        }

        // 1. Register the agent row.
        let agent = agent_service::register(
            &self.db,
            &agent_service::RegisterAgent {
                name: &format!("worker-{}", task.name),
                runtime: AgentRuntime::ClaudeCode,
                role: AgentRole::Worker,
                capabilities: None,
                workflow_id: Some(&self.workflow_id),
                workspace_path: None,
                metadata: None,
            },
        )
        .await
        .context("failed to register agent")?;

        // 2. Take the task. A lost race aborts the spawn.
        if let Err(e) = self.acquire_task(task, &agent.id).await {
            let _ = agent_service::unregister(&self.db, &agent.id).await;
            return Err(e);
        }

        // 3. Resolve the worktree: a named slug for ephemeral mode, the
        // task's workspace otherwise (provisioned on the spot when the
        // workflow asks for auto-created workspaces).
        let (worktree_slug, working_dir) = if self.config.ephemeral_worktree {
            (
                Some(format!(
                    "caw-{}-{}",
                    worktree::slug(&workflow.name),
                    worktree::slug(&task.name)
                )),
                None,
            )
        } else {
            let dir = match &task.workspace_id {
                Some(workspace_id) => workspace_db::get_workspace(&self.db, workspace_id)
                    .await?
                    .map(|w| std::path::PathBuf::from(w.path)),
                None if workflow.auto_create_workspaces => {
                    self.provision_workspace(workflow, task).await
                }
                None => None,
            };
            (None, dir)
        };

        // 4-5. Prompt assembly, routing, resume lookup.
        let history = message_db::list_for_task(&self.db, &task.id)
            .await
            .unwrap_or_default();

        let resume_session_id = self
            .session_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&task.id)
            .cloned();

        let hint = routing::hint_from_context(task.context.as_deref());
        let complexity = routing::classify(hint.as_deref(), &task.name, &task.description);
        let route = routing::route(complexity);

        let prompt = if resume_session_id.is_some() {
            format!(
                "Continue working on task {:?} (id {}). Re-read its checkpoints and any \
                 operator answers with the caw tools, then finish the task.",
                task.name, task.id
            )
        } else {
            build_task_prompt(task)
        };
        let system_prompt = if resume_session_id.is_some() {
            None
        } else {
            Some(build_system_prompt(&self.db, workflow, task, &agent.id, &history).await?)
        };

        let spec = SpawnSpec {
            workflow_id: self.workflow_id.clone(),
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            prompt,
            system_prompt,
            resume_session_id,
            model: route.model.to_string(),
            max_turns: route.max_turns,
            max_budget_usd: route.max_budget_usd,
            worktree_slug,
            working_dir,
            mcp_port: self.config.mcp_port,
            permission_mode: self.config.permission_mode,
        };

        // 6. Spawn the child.
        let handle = match self.launcher.spawn(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let _ = task_db::release_task(&self.db, &task.id, &agent.id).await;
                let _ = agent_service::unregister(&self.db, &agent.id).await;
                return Err(e).context("failed to spawn agent process");
            }
        };

        info!(
            task_id = %task.id,
            agent_id = %agent.id,
            model = route.model,
            complexity = %complexity,
            "agent spawned"
        );

        // 7. Supervise.
        let abort = CancellationToken::new();
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                task.id.clone(),
                ActiveAgent {
                    agent_id: agent.id.clone(),
                    abort: abort.clone(),
                },
            );
        }

        self.listeners.emit(&SpawnerEvent::AgentStarted {
            workflow_id: self.workflow_id.clone(),
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
        });

        let pool = Arc::clone(self);
        let task_id = task.id.clone();
        let agent_id = agent.id.clone();
        tokio::spawn(async move {
            pool.supervise(handle, task_id, agent_id, abort).await;
        });

        Ok(())
    }

    /// Cut a worktree for a workspace-less task and record it as the
    /// task's workspace. Best-effort: any failure is logged and the agent
    /// falls back to running without a working directory.
    async fn provision_workspace(
        &self,
        workflow: &Workflow,
        task: &Task,
    ) -> Option<std::path::PathBuf> {
        let repos = workflow_db::list_repositories(&self.db, &workflow.id)
            .await
            .ok()?;
        let repo = repos.into_iter().next()?;

        let trees = match Worktrees::open(&repo.path) {
            Ok(trees) => trees,
            Err(e) => {
                warn!(repo = %repo.path, error = %e, "cannot open repository for worktree");
                return None;
            }
        };
        let provisioned = match trees.provision(&workflow.name, &task.name, None) {
            Ok(provisioned) => provisioned,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "worktree provisioning failed");
                return None;
            }
        };

        let path_str = provisioned.path.to_string_lossy();
        match workspace_db::insert_workspace(
            &self.db,
            &workspace_db::NewWorkspace {
                workflow_id: &workflow.id,
                path: path_str.as_ref(),
                branch: &provisioned.branch,
                base_branch: &provisioned.base_branch,
            },
        )
        .await
        {
            Ok(workspace) => {
                let _ = task_db::assign_workspace(&self.db, &task.id, &workspace.id, Some(&repo.id))
                    .await;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "failed to record provisioned workspace");
            }
        }

        Some(provisioned.path)
    }

    /// Take ownership of a task in whatever claimable shape it is in.
    async fn acquire_task(&self, task: &Task, agent_id: &str) -> Result<()> {
        match task.status {
            TaskStatus::Pending | TaskStatus::Blocked | TaskStatus::Planning => {
                let claim = task_service::claim(&self.db, &task.id, agent_id)
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                if !claim.success {
                    bail!(
                        "task {} already claimed by {}",
                        task.id,
                        claim.already_claimed_by.unwrap_or_default()
                    );
                }
                TaskStateMachine::transition(
                    &self.db,
                    &task.id,
                    TaskStatus::Planning,
                    TaskStatus::InProgress,
                )
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            }
            TaskStatus::Failed => {
                // Retry path: walk the task back onto the working edge,
                // then adopt it.
                TaskStateMachine::transition(
                    &self.db,
                    &task.id,
                    TaskStatus::Failed,
                    TaskStatus::InProgress,
                )
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
                let rows = task_db::adopt_task(&self.db, &task.id, agent_id).await?;
                if rows == 0 {
                    bail!("lost adoption race for retried task {}", task.id);
                }
            }
            TaskStatus::InProgress if task.assigned_agent_id.is_none() => {
                // Resume path: assignment was cleared when the operator's
                // answer arrived.
                let rows = task_db::adopt_task(&self.db, &task.id, agent_id).await?;
                if rows == 0 {
                    bail!("lost adoption race for resumed task {}", task.id);
                }
            }
            other => bail!("task {} is not claimable in status {other}", task.id),
        }

        let _ = agent_db::update_agent(
            &self.db,
            agent_id,
            &agent_db::AgentUpdate {
                status: Some(caw_db::models::AgentStatus::Busy),
                current_task_id: Some(Some(&task.id)),
                ..Default::default()
            },
        )
        .await;

        Ok(())
    }

    /// Drive one agent session to completion.
    async fn supervise(
        self: Arc<Self>,
        handle: crate::spawner::launcher::AgentHandle,
        task_id: String,
        agent_id: String,
        abort: CancellationToken,
    ) {
        let mut events = self.launcher.events(&handle);
        let mut monitor = StagnationMonitor::new(self.config.stagnation.clone());
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut stagnation_tick = tokio::time::interval(self.config.stagnation.check_interval);
        stagnation_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut saw_success = false;
        let mut child_errors: Vec<String> = Vec::new();
        let mut exit_clean = false;
        let mut exit_stderr = String::new();
        let mut iteration: u64 = 0;
        let mut kill_sent = false;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(AgentStreamEvent::Init { session_id }) => {
                        self.session_cache
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .insert(task_id.clone(), session_id);
                    }
                    Some(AgentStreamEvent::Assistant { content }) => {
                        monitor.note_turn();
                        let snippet: String = content.chars().take(120).collect();
                        monitor.observe("assistant", &snippet, iteration);
                        iteration += 1;
                    }
                    Some(AgentStreamEvent::Result { success, errors }) => {
                        saw_success = success;
                        child_errors = errors;
                    }
                    Some(AgentStreamEvent::Exited { clean, stderr }) => {
                        exit_clean = clean;
                        exit_stderr = stderr;
                        break;
                    }
                    None => break,
                },
                _ = abort.cancelled(), if !kill_sent => {
                    kill_sent = true;
                    if let Err(e) = self.launcher.kill(&handle).await {
                        warn!(task_id = %task_id, error = %e, "failed to kill aborted agent");
                    }
                    // Keep draining the stream until EOF.
                }
                _ = heartbeat.tick() => {
                    let _ = agent_db::heartbeat(&self.db, &agent_id).await;
                }
                _ = stagnation_tick.tick() => {
                    if let Some(level) = monitor.check() {
                        self.handle_escalation(&handle, &task_id, level, &mut kill_sent).await;
                    }
                }
            }
        }

        self.dispatch_completion(
            &task_id,
            &agent_id,
            saw_success,
            exit_clean,
            &child_errors,
            &exit_stderr,
        )
        .await;
    }

    async fn handle_escalation(
        &self,
        handle: &crate::spawner::launcher::AgentHandle,
        task_id: &str,
        level: EscalationLevel,
        kill_sent: &mut bool,
    ) {
        self.listeners.emit(&SpawnerEvent::AgentStagnation {
            workflow_id: self.workflow_id.clone(),
            task_id: task_id.to_string(),
            level: level.as_str().to_string(),
        });

        match level {
            EscalationLevel::Pause => {
                if let Err(e) = TaskStateMachine::transition(
                    &self.db,
                    task_id,
                    TaskStatus::InProgress,
                    TaskStatus::Paused,
                )
                .await
                {
                    warn!(task_id, error = %e, "failed to pause stagnating task");
                }
            }
            EscalationLevel::Abort => {
                if !*kill_sent {
                    *kill_sent = true;
                    if let Err(e) = self.launcher.kill(handle).await {
                        warn!(task_id, error = %e, "failed to kill stagnating agent");
                    }
                }
            }
            _ => {}
        }
    }

    /// Classify how the session ended and apply the retry policy.
    async fn dispatch_completion(
        &self,
        task_id: &str,
        agent_id: &str,
        saw_success: bool,
        exit_clean: bool,
        child_errors: &[String],
        stderr: &str,
    ) {
        {
            // A newer agent may already be supervising this task; only
            // drop the entry that is actually ours.
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(task_id).is_some_and(|a| a.agent_id == agent_id) {
                active.remove(task_id);
            }
        }

        let task = match task_db::get_task(&self.db, task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "task row vanished during agent run");
                let _ = agent_db::set_offline(&self.db, agent_id).await;
                return;
            }
            Err(e) => {
                warn!(task_id, error = %e, "failed to re-read task after agent exit");
                let _ = agent_db::set_offline(&self.db, agent_id).await;
                return;
            }
        };

        // Phantom-completion guard: the child saying "success" counts only
        // when the database agrees.
        let db_terminal = task.status.is_terminal();

        if saw_success && db_terminal {
            info!(task_id, agent_id, "agent completed task");
            self.listeners.emit(&SpawnerEvent::AgentCompleted {
                workflow_id: self.workflow_id.clone(),
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
            });
            let _ = agent_db::set_offline(&self.db, agent_id).await;
            return;
        }

        if task.status == TaskStatus::Paused {
            // Waiting on the operator; the poll loop resumes it later.
            // Keep the assignment so the query can be correlated.
            info!(task_id, agent_id, "agent exited with task paused");
            let _ = agent_db::set_offline(&self.db, agent_id).await;
            return;
        }

        // Failure, or "exited without completing the task".
        let error = if !child_errors.is_empty() {
            child_errors.join("; ")
        } else if saw_success && !db_terminal {
            format!("agent reported success but task status is {}", task.status)
        } else if !exit_clean {
            let tail: String = stderr.chars().rev().take(400).collect::<String>();
            let tail: String = tail.chars().rev().collect();
            format!("agent process exited unsuccessfully: {}", tail.trim())
        } else {
            "agent exited without completing the task".to_string()
        };

        let attempt = {
            let mut retries = self.retries.lock().unwrap_or_else(|e| e.into_inner());
            let attempt = retries.entry(task_id.to_string()).or_insert(0);
            *attempt += 1;
            *attempt
        };

        if attempt <= MAX_RETRIES {
            warn!(task_id, attempt, error = %error, "agent attempt failed, will retry");
            let _ = task_db::release_tasks_for_agent(&self.db, agent_id).await;
            self.listeners.emit(&SpawnerEvent::AgentRetrying {
                workflow_id: self.workflow_id.clone(),
                task_id: task_id.to_string(),
                attempt,
            });
        } else {
            warn!(task_id, error = %error, "retry budget exhausted, failing task");
            self.exhausted
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task_id.to_string());
            self.force_fail(task_id, &error).await;
            self.listeners.emit(&SpawnerEvent::AgentFailed {
                workflow_id: self.workflow_id.clone(),
                task_id: task_id.to_string(),
                error,
            });
        }

        let _ = agent_db::set_offline(&self.db, agent_id).await;
    }

    /// Walk a task through legal transitions to `failed`, wherever it
    /// currently sits.
    async fn force_fail(&self, task_id: &str, error: &str) {
        for _ in 0..4 {
            let Ok(Some(task)) = task_db::get_task(&self.db, task_id).await else {
                return;
            };
            match task.status {
                TaskStatus::Failed | TaskStatus::Completed | TaskStatus::Skipped => return,
                TaskStatus::InProgress => {
                    let _ = task_db::fail_task(&self.db, task_id, error).await;
                }
                TaskStatus::Planning => {
                    let _ = TaskStateMachine::transition(
                        &self.db,
                        task_id,
                        TaskStatus::Planning,
                        TaskStatus::InProgress,
                    )
                    .await;
                }
                TaskStatus::Pending | TaskStatus::Blocked => {
                    let _ = TaskStateMachine::transition(
                        &self.db,
                        task_id,
                        task.status,
                        TaskStatus::Planning,
                    )
                    .await;
                }
                TaskStatus::Paused => {
                    let _ = TaskStateMachine::transition(
                        &self.db,
                        task_id,
                        TaskStatus::Paused,
                        TaskStatus::InProgress,
                    )
                    .await;
                }
            }
        }
    }
}

/// The `-p` prompt for a first spawn.
fn build_task_prompt(task: &Task) -> String {
    let mut prompt = format!("Work on task {:?} (id {}).\n\n{}", task.name, task.id, task.description);
    if let Some(plan) = &task.plan {
        prompt.push_str("\n\nExisting plan:\n");
        prompt.push_str(plan);
    }
    prompt
}

/// Assemble the system prompt: identity, task, workflow summary, tool
/// protocol, dependency chain, worktree info, and Q&A history.
async fn build_system_prompt(
    db: &SqlitePool,
    workflow: &Workflow,
    task: &Task,
    agent_id: &str,
    history: &[Message],
) -> Result<String> {
    let deps = task_db::get_dependencies(db, &task.id).await?;

    let mut out = String::new();
    out.push_str(&format!(
        "You are agent {agent_id}, a worker in workflow {:?} (id {}).\n",
        workflow.name, workflow.id
    ));
    out.push_str(&format!(
        "Your task is {:?} (id {}). Status and all coordination go through the caw MCP tools.\n\n",
        task.name, task.id
    ));

    if let Some(summary) = &workflow.plan_summary {
        out.push_str("Workflow plan:\n");
        out.push_str(summary);
        out.push_str("\n\n");
    }

    if !deps.is_empty() {
        out.push_str("Completed dependencies and their outcomes:\n");
        for dep in &deps {
            out.push_str(&format!(
                "  - {:?} [{}]: {}\n",
                dep.name,
                dep.status,
                dep.outcome.as_deref().unwrap_or("(no outcome recorded)")
            ));
        }
        out.push('\n');
    }

    out.push_str(
        "Protocol:\n\
         - record progress with checkpoint_add as you work;\n\
         - ask the operator questions with message_send (message_type \"query\") and move the task to \"paused\";\n\
         - when done, call task_update_status with status \"completed\" and a non-empty outcome;\n\
         - on an unrecoverable problem, call task_update_status with status \"failed\" and a non-empty error.\n",
    );

    if let Some(workspace_id) = &task.workspace_id {
        if let Some(workspace) = workspace_db::get_workspace(db, workspace_id).await? {
            out.push_str(&format!(
                "\nYou work in the git worktree at {} on branch {} (base {}).\n",
                workspace.path, workspace.branch, workspace.base_branch
            ));
        }
    }

    if !history.is_empty() {
        out.push_str("\nPrior messages about this task:\n");
        for message in history {
            out.push_str(&format!(
                "  [{}] {}: {}\n",
                message.message_type, message.sender_id, message.body
            ));
        }
    }

    Ok(out)
}

