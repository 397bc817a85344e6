//! End-to-end spawner scenarios with a mock child.

mod common;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use caw_db::models::{TaskStatus, WorkflowStatus};
use caw_db::queries::tasks as task_db;
use caw_db::queries::workflows as workflow_db;
use caw_core::spawner::events::SpawnerEvent;
use caw_core::spawner::runner::{self, RunnerOptions, WorkflowOutcome};
use caw_core::spawner::{SpawnerConfig, WorkflowSpawner};
use caw_test_utils::create_test_db;

use common::{MockLauncher, grouped_spec, seed_workflow, spec};

fn fast_config() -> SpawnerConfig {
    SpawnerConfig {
        poll_interval: Duration::from_millis(50),
        ..SpawnerConfig::new(3100)
    }
}

type EventLog = Arc<StdMutex<Vec<SpawnerEvent>>>;

fn reporter(log: &EventLog) -> Arc<dyn Fn(&SpawnerEvent) + Send + Sync> {
    let log = Arc::clone(log);
    Arc::new(move |event| {
        log.lock().unwrap().push(event.clone());
    })
}

async fn wait_until<F>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_task_runs_to_completion() {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "Only", 1, &[spec("Only Task", &[])]).await;

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        1,
    );

    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner::run_workflow(
            spawner,
            RunnerOptions {
                reporter: Some(reporter(&events)),
                ..Default::default()
            },
        ),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(outcome, WorkflowOutcome::Completed);
    assert_eq!(launcher.spawn_count(), 1);

    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);

    let task = task_db::get_task(&db.pool, &tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.outcome.is_some());
    assert!(task.assigned_agent_id.is_none());

    let events = events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, SpawnerEvent::WorkflowAllComplete { .. })));
}

#[tokio::test]
async fn sequential_dependency_runs_in_order() {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let (workflow_id, tasks) = seed_workflow(
        &db.pool,
        "Sequential",
        2,
        &[spec("Task A", &[]), spec("Task B", &["Task A"])],
    )
    .await;

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        2,
    );

    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner::run_workflow(
            spawner,
            RunnerOptions {
                reporter: Some(reporter(&events)),
                ..Default::default()
            },
        ),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(outcome, WorkflowOutcome::Completed);
    assert_eq!(launcher.spawn_count(), 2);

    for task in &tasks {
        let row = task_db::get_task(&db.pool, &task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed, "task {}", row.name);
    }

    // A's agent must start before B's: B was blocked on A.
    let events = events.lock().unwrap();
    let starts: Vec<&String> = events
        .iter()
        .filter_map(|e| match e {
            SpawnerEvent::AgentStarted { task_id, .. } => Some(task_id),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![&tasks[0].id, &tasks[1].id]);
}

#[tokio::test]
async fn fan_in_spawns_group_then_join() {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let (workflow_id, tasks) = seed_workflow(
        &db.pool,
        "FanIn",
        3,
        &[
            grouped_spec("Task A", "g1"),
            grouped_spec("Task B", "g1"),
            spec("Task C", &["Task A", "Task B"]),
        ],
    )
    .await;

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        3,
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner::run_workflow(spawner, RunnerOptions::default()),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(outcome, WorkflowOutcome::Completed);
    assert_eq!(launcher.spawn_count(), 3);

    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
    for task in &tasks {
        let row = task_db::get_task(&db.pool, &task.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn suspend_then_resume_completes() {
    let db = create_test_db().await;
    // Children hang until killed, so the run stays in flight.
    let launcher = MockLauncher::new(db.pool.clone(), false);
    let (workflow_id, _tasks) = seed_workflow(
        &db.pool,
        "SuspendResume",
        1,
        &[spec("Task A", &[]), spec("Task B", &["Task A"])],
    )
    .await;

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        1,
    );

    spawner.start().await.expect("start failed");

    {
        let launcher = launcher.clone();
        wait_until(Duration::from_secs(5), move || launcher.spawn_count() >= 1).await;
    }
    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::InProgress);

    let agents_stopped = spawner.suspend().await.expect("suspend failed");
    assert!(agents_stopped >= 1);
    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Paused);

    // Let the children finish on their next attempt, then resume.
    launcher.set_auto_complete(true);
    spawner.resume().await.expect("resume failed");

    let pool = db.pool.clone();
    let wf = workflow_id.clone();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let workflow = workflow_db::get_workflow(&pool, &wf).await.unwrap().unwrap();
        if workflow.status == WorkflowStatus::Completed {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow did not complete after resume (status {})",
            workflow.status
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let tasks = task_db::list_tasks_for_workflow(&db.pool, &workflow_id).await.unwrap();
    assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
    spawner.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_workflow() {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), false);
    launcher.set_fail_fast(true);
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "Doomed", 1, &[spec("Task A", &[])]).await;

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        1,
    );

    let events: EventLog = Arc::new(StdMutex::new(Vec::new()));
    let outcome = tokio::time::timeout(
        Duration::from_secs(15),
        runner::run_workflow(
            spawner,
            RunnerOptions {
                reporter: Some(reporter(&events)),
                ..Default::default()
            },
        ),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert!(matches!(outcome, WorkflowOutcome::Failed { .. }));
    // Initial attempt + 3 retries.
    assert_eq!(launcher.spawn_count(), 4);

    let task = task_db::get_task(&db.pool, &tasks[0].id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());

    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);

    let events = events.lock().unwrap();
    let retry_count = events
        .iter()
        .filter(|e| matches!(e, SpawnerEvent::AgentRetrying { .. }))
        .count();
    assert_eq!(retry_count, 3);
    assert!(events.iter().any(|e| matches!(e, SpawnerEvent::AgentFailed { .. })));
}

#[tokio::test]
async fn completion_with_pr_urls_awaits_merge() {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let (workflow_id, _tasks) =
        seed_workflow(&db.pool, "WithPr", 1, &[spec("Task A", &[])]).await;

    // A workspace with a PR URL makes the run classify as awaiting_merge.
    let workspace = caw_core::services::workspace::create(
        &db.pool,
        &workflow_id,
        "/tmp/caw-wt",
        "caw/withpr/task-a",
        "main",
    )
    .await
    .unwrap();
    caw_core::services::workspace::update(
        &db.pool,
        &workspace.id,
        None,
        Some("https://github.com/acme/repo/pull/7"),
        None,
    )
    .await
    .unwrap();

    let spawner = WorkflowSpawner::new(
        db.pool.clone(),
        workflow_id.clone(),
        launcher.clone(),
        fast_config(),
        1,
    );

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        runner::run_workflow(spawner, RunnerOptions::default()),
    )
    .await
    .expect("run timed out")
    .expect("run failed");

    assert_eq!(
        outcome,
        WorkflowOutcome::AwaitingMerge {
            pr_urls: vec!["https://github.com/acme/repo/pull/7".to_string()]
        }
    );

    let workflow = workflow_db::get_workflow(&db.pool, &workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::AwaitingMerge);
}
