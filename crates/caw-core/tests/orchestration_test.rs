//! Scheduling queries: next-task selection, grouping, and progress.

mod common;

use caw_db::models::TaskStatus;
use caw_core::orchestration;
use caw_core::services::task;
use caw_core::services::task::StatusExtras;
use caw_test_utils::create_test_db;

use common::{grouped_spec, seed_workflow, spec};

#[tokio::test]
async fn next_tasks_respects_dependencies() {
    let db = create_test_db().await;
    let (workflow_id, tasks) = seed_workflow(
        &db.pool,
        "deps",
        1,
        &[spec("a", &[]), spec("b", &["a"]), spec("c", &["b"])],
    )
    .await;

    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    assert!(!next.all_complete);
    let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["a"]);

    // Completing "a" unblocks "b" but not "c".
    complete(&db.pool, &tasks[0].id).await;
    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);
}

#[tokio::test]
async fn next_tasks_groups_parallel_siblings() {
    let db = create_test_db().await;
    let (workflow_id, _tasks) = seed_workflow(
        &db.pool,
        "groups",
        4,
        &[
            grouped_spec("g1-first", "g1"),
            spec("solo", &[]),
            grouped_spec("g1-second", "g1"),
            spec("tail", &[]),
        ],
    )
    .await;

    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
    // Members of g1 come back together, ahead of the ungrouped task that
    // sat between them.
    assert_eq!(names, vec!["g1-first", "g1-second", "solo", "tail"]);
}

#[tokio::test]
async fn next_tasks_skips_assigned_and_optionally_failed() {
    let db = create_test_db().await;
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "skips", 2, &[spec("a", &[]), spec("b", &[])]).await;

    // Claim "a": it must disappear from the schedule.
    let agent = caw_core::services::agent::register(
        &db.pool,
        &caw_core::services::agent::RegisterAgent {
            name: "w",
            runtime: caw_db::models::AgentRuntime::ClaudeCode,
            role: caw_db::models::AgentRole::Worker,
            capabilities: None,
            workflow_id: None,
            workspace_path: None,
            metadata: None,
        },
    )
    .await
    .unwrap();
    task::claim(&db.pool, &tasks[0].id, &agent.id).await.unwrap();

    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    // Fail "a" (through in_progress); include_failed controls visibility.
    task::update_status(&db.pool, &tasks[0].id, TaskStatus::InProgress, &StatusExtras::default())
        .await
        .unwrap();
    task::update_status(
        &db.pool,
        &tasks[0].id,
        TaskStatus::Failed,
        &StatusExtras { outcome: None, error: Some("broke") },
    )
    .await
    .unwrap();

    let with_failed = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    assert!(with_failed.tasks.iter().any(|t| t.name == "a"));

    let without_failed = orchestration::get_next_tasks(&db.pool, &workflow_id, false).await.unwrap();
    assert!(!without_failed.tasks.iter().any(|t| t.name == "a"));
}

#[tokio::test]
async fn skipped_dependencies_satisfy_dependents() {
    let db = create_test_db().await;
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "skipped", 1, &[spec("a", &[]), spec("b", &["a"])]).await;

    task::update_status(&db.pool, &tasks[0].id, TaskStatus::Skipped, &StatusExtras::default())
        .await
        .unwrap();

    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    let names: Vec<&str> = next.tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    let check = task::check_dependencies(&db.pool, &tasks[1].id).await.unwrap();
    assert!(check.satisfied);
    assert!(check.missing.is_empty());
}

#[tokio::test]
async fn progress_counts_and_all_complete() {
    let db = create_test_db().await;
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "progress", 2, &[spec("a", &[]), spec("b", &[])]).await;

    let progress = orchestration::get_progress(&db.pool, &workflow_id).await.unwrap();
    assert_eq!(progress.total_tasks, 2);
    assert_eq!(progress.by_status.pending, 2);
    assert_eq!(progress.estimated_remaining, 2);

    complete(&db.pool, &tasks[0].id).await;
    task::update_status(&db.pool, &tasks[1].id, TaskStatus::Skipped, &StatusExtras::default())
        .await
        .unwrap();

    let progress = orchestration::get_progress(&db.pool, &workflow_id).await.unwrap();
    assert_eq!(progress.by_status.completed, 1);
    assert_eq!(progress.by_status.skipped, 1);
    assert_eq!(progress.estimated_remaining, 0);

    let next = orchestration::get_next_tasks(&db.pool, &workflow_id, true).await.unwrap();
    assert!(next.all_complete);
    assert!(next.tasks.is_empty());
}

async fn complete(db: &sqlx::SqlitePool, task_id: &str) {
    let agent = caw_core::services::agent::register(
        db,
        &caw_core::services::agent::RegisterAgent {
            name: "completer",
            runtime: caw_db::models::AgentRuntime::ClaudeCode,
            role: caw_db::models::AgentRole::Worker,
            capabilities: None,
            workflow_id: None,
            workspace_path: None,
            metadata: None,
        },
    )
    .await
    .unwrap();
    task::claim(db, task_id, &agent.id).await.unwrap();
    task::update_status(db, task_id, TaskStatus::InProgress, &StatusExtras::default())
        .await
        .unwrap();
    task::update_status(
        db,
        task_id,
        TaskStatus::Completed,
        &StatusExtras { outcome: Some("done"), error: None },
    )
    .await
    .unwrap();
}
