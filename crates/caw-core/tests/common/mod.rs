//! Shared fixtures for caw-core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use sqlx::SqlitePool;
use tokio::sync::Notify;

use caw_db::queries::tasks as task_db;
use caw_core::services::workflow::{self, CreateWorkflow, TaskSpec};
use caw_core::spawner::launcher::{
    AgentHandle, AgentLauncher, AgentStreamEvent, SpawnSpec,
};

/// A synchronous mock child: when auto-complete is on, spawning it marks
/// the task completed in the database (as the real child would through the
/// RPC surface) and its event stream reports success. With auto-complete
/// off it hangs until killed.
pub struct MockLauncher {
    db: SqlitePool,
    auto_complete: AtomicBool,
    fail_fast: AtomicBool,
    spawn_count: AtomicUsize,
    next_pid: AtomicU32,
    states: StdMutex<HashMap<u32, MockProcess>>,
}

struct MockProcess {
    completed: bool,
    fail_fast: bool,
    kill: Arc<Notify>,
    killed: Arc<AtomicBool>,
}

impl MockLauncher {
    pub fn new(db: SqlitePool, auto_complete: bool) -> Arc<Self> {
        Arc::new(Self {
            db,
            auto_complete: AtomicBool::new(auto_complete),
            fail_fast: AtomicBool::new(false),
            spawn_count: AtomicUsize::new(0),
            next_pid: AtomicU32::new(1000),
            states: StdMutex::new(HashMap::new()),
        })
    }

    pub fn set_auto_complete(&self, on: bool) {
        self.auto_complete.store(on, Ordering::SeqCst);
    }

    /// Every spawned child exits unsuccessfully right away.
    pub fn set_fail_fast(&self, on: bool) {
        self.fail_fast.store(on, Ordering::SeqCst);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentLauncher for MockLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        let fail_fast = self.fail_fast.load(Ordering::SeqCst);
        let completed = !fail_fast && self.auto_complete.load(Ordering::SeqCst);
        if completed {
            // The task is in_progress at spawn time; complete it the way
            // the real child does via task_update_status.
            let rows = task_db::complete_task(&self.db, &spec.task_id, "done by mock agent").await?;
            anyhow::ensure!(rows == 1, "mock child could not complete task {}", spec.task_id);
        }

        self.states.lock().unwrap().insert(
            pid,
            MockProcess {
                completed,
                fail_fast,
                kill: Arc::new(Notify::new()),
                killed: Arc::new(AtomicBool::new(false)),
            },
        );

        Ok(AgentHandle {
            pid,
            task_id: spec.task_id.clone(),
            agent_id: spec.agent_id.clone(),
            session_id: Arc::new(StdMutex::new(None)),
        })
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentStreamEvent> + Send>> {
        let (completed, fail_fast, kill, killed) = {
            let states = self.states.lock().unwrap();
            let state = states.get(&handle.pid).expect("unknown mock pid");
            (
                state.completed,
                state.fail_fast,
                Arc::clone(&state.kill),
                Arc::clone(&state.killed),
            )
        };

        Box::pin(async_stream::stream! {
            if completed {
                yield AgentStreamEvent::Result { success: true, errors: vec![] };
                yield AgentStreamEvent::Exited { clean: true, stderr: String::new() };
            } else if fail_fast {
                yield AgentStreamEvent::Result {
                    success: false,
                    errors: vec!["mock child crashed".to_string()],
                };
                yield AgentStreamEvent::Exited { clean: false, stderr: "crash".to_string() };
            } else {
                if !killed.load(Ordering::SeqCst) {
                    kill.notified().await;
                }
                yield AgentStreamEvent::Exited { clean: false, stderr: "killed".to_string() };
            }
        })
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        if let Some(state) = self.states.lock().unwrap().get(&handle.pid) {
            state.killed.store(true, Ordering::SeqCst);
            state.kill.notify_waiters();
            state.kill.notify_one();
        }
        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        self.states
            .lock()
            .unwrap()
            .get(&handle.pid)
            .is_some_and(|s| !s.completed && !s.killed.load(Ordering::SeqCst))
    }
}

/// Create a workflow with a plan installed, returning `(workflow_id,
/// task ids by name order)`.
pub async fn seed_workflow(
    db: &SqlitePool,
    name: &str,
    max_parallel: i64,
    specs: &[TaskSpec],
) -> (String, Vec<caw_db::models::Task>) {
    let created = workflow::create(
        db,
        &CreateWorkflow {
            name: name.to_string(),
            source: caw_db::models::WorkflowSource::Prompt,
            source_reference: None,
            source_content: None,
            max_parallel_tasks: max_parallel,
            auto_create_workspaces: false,
        },
    )
    .await
    .expect("workflow create failed");

    let tasks = workflow::set_plan(db, &created.id, "test plan", specs)
        .await
        .expect("set_plan failed");

    (created.id, tasks)
}

/// Shorthand for a task spec.
pub fn spec(name: &str, depends_on: &[&str]) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        description: format!("{name} description"),
        parallel_group: None,
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
    }
}

/// A task spec with a parallel group label.
pub fn grouped_spec(name: &str, group: &str) -> TaskSpec {
    TaskSpec {
        name: name.to_string(),
        description: format!("{name} description"),
        parallel_group: Some(group.to_string()),
        depends_on: vec![],
    }
}
