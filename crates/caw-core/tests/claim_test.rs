//! The claim/release protocol and its invariants.

mod common;

use caw_db::models::{AgentRole, AgentRuntime, TaskStatus};
use caw_db::queries::tasks as task_db;
use caw_core::error::ErrorCode;
use caw_core::services::{agent, task};
use caw_core::services::agent::RegisterAgent;
use caw_core::services::task::StatusExtras;
use caw_test_utils::create_test_db;

use common::{seed_workflow, spec};

async fn register_agent(db: &sqlx::SqlitePool, name: &str) -> String {
    agent::register(
        db,
        &RegisterAgent {
            name,
            runtime: AgentRuntime::ClaudeCode,
            role: AgentRole::Worker,
            capabilities: None,
            workflow_id: None,
            workspace_path: None,
            metadata: None,
        },
    )
    .await
    .unwrap()
    .id
}

#[tokio::test]
async fn claim_assigns_exactly_one_agent() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "claims", 1, &[spec("a", &[])]).await;
    let alice = register_agent(&db.pool, "alice").await;
    let bob = register_agent(&db.pool, "bob").await;

    let first = task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap();
    assert!(first.success);
    assert!(first.already_claimed_by.is_none());

    // The loser gets data, not an error.
    let second = task::claim(&db.pool, &tasks[0].id, &bob).await.unwrap();
    assert!(!second.success);
    assert_eq!(second.already_claimed_by.as_deref(), Some(alice.as_str()));

    // IP.1: assigned implies a working status.
    let row = task_db::get_task(&db.pool, &tasks[0].id).await.unwrap().unwrap();
    assert_eq!(row.assigned_agent_id.as_deref(), Some(alice.as_str()));
    assert!(matches!(row.status, TaskStatus::Planning | TaskStatus::InProgress));
    assert!(row.claimed_at.is_some());
}

#[tokio::test]
async fn claim_is_idempotent_for_the_holder() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "idem", 1, &[spec("a", &[])]).await;
    let alice = register_agent(&db.pool, "alice").await;

    assert!(task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap().success);
    assert!(task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap().success);
}

#[tokio::test]
async fn claim_blocked_task_reports_task_blocked() {
    let db = create_test_db().await;
    let (_wf, tasks) =
        seed_workflow(&db.pool, "blocked", 1, &[spec("a", &[]), spec("b", &["a"])]).await;
    let alice = register_agent(&db.pool, "alice").await;

    let err = task::claim(&db.pool, &tasks[1].id, &alice).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskBlocked);
    assert!(err.code.recoverable());
    assert!(err.message.contains("a"));
}

#[tokio::test]
async fn claim_requires_a_registered_agent() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "noagent", 1, &[spec("a", &[])]).await;

    let err = task::claim(&db.pool, &tasks[0].id, "ag_missing").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::AgentNotFound);
}

#[tokio::test]
async fn release_resets_status_and_rejects_non_owners() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "release", 1, &[spec("a", &[])]).await;
    let alice = register_agent(&db.pool, "alice").await;
    let bob = register_agent(&db.pool, "bob").await;

    // Unclaimed release -> NOT_CLAIMED.
    let err = task::release(&db.pool, &tasks[0].id, &alice).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotClaimed);

    task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap();

    // Non-owner release -> NOT_ASSIGNED.
    let err = task::release(&db.pool, &tasks[0].id, &bob).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotAssigned);

    // Owner release clears assignment and resets to pending.
    task::release(&db.pool, &tasks[0].id, &alice).await.unwrap();
    let row = task_db::get_task(&db.pool, &tasks[0].id).await.unwrap().unwrap();
    assert!(row.assigned_agent_id.is_none());
    assert_eq!(row.status, TaskStatus::Pending);
}

#[tokio::test]
async fn complete_requires_outcome_and_fail_requires_error() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "guards", 1, &[spec("a", &[])]).await;
    let alice = register_agent(&db.pool, "alice").await;

    task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap();
    task::update_status(&db.pool, &tasks[0].id, TaskStatus::InProgress, &StatusExtras::default())
        .await
        .unwrap();

    let err = task::update_status(
        &db.pool,
        &tasks[0].id,
        TaskStatus::Completed,
        &StatusExtras::default(),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingOutcome);

    let err = task::update_status(
        &db.pool,
        &tasks[0].id,
        TaskStatus::Failed,
        &StatusExtras { outcome: None, error: Some("   ") },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingError);

    let done = task::update_status(
        &db.pool,
        &tasks[0].id,
        TaskStatus::Completed,
        &StatusExtras { outcome: Some("wired the parser"), error: None },
    )
    .await
    .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.outcome.as_deref(), Some("wired the parser"));
    assert!(done.assigned_agent_id.is_none());
}

#[tokio::test]
async fn invalid_transitions_are_rejected() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "invalid", 1, &[spec("a", &[])]).await;

    // pending -> completed skips the machine entirely.
    let err = task::update_status(
        &db.pool,
        &tasks[0].id,
        TaskStatus::Completed,
        &StatusExtras { outcome: Some("nope"), error: None },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTransition);
}

#[tokio::test]
async fn unregister_releases_all_claims() {
    let db = create_test_db().await;
    let (_wf, tasks) =
        seed_workflow(&db.pool, "cleanup", 2, &[spec("a", &[]), spec("b", &[])]).await;
    let alice = register_agent(&db.pool, "alice").await;

    task::claim(&db.pool, &tasks[0].id, &alice).await.unwrap();
    task::claim(&db.pool, &tasks[1].id, &alice).await.unwrap();

    let released = agent::unregister(&db.pool, &alice).await.unwrap();
    assert_eq!(released, 2);

    for t in &tasks {
        let row = task_db::get_task(&db.pool, &t.id).await.unwrap().unwrap();
        assert!(row.assigned_agent_id.is_none());
        assert_eq!(row.status, TaskStatus::Pending);
    }

    let agent_row = agent::get(&db.pool, &alice).await.unwrap();
    assert_eq!(agent_row.status, caw_db::models::AgentStatus::Offline);
}

#[tokio::test]
async fn checkpoint_sequences_are_dense_and_ordered() {
    let db = create_test_db().await;
    let (_wf, tasks) = seed_workflow(&db.pool, "cps", 1, &[spec("a", &[])]).await;

    for (index, summary) in ["started", "halfway", "done"].iter().enumerate() {
        let cp = caw_core::services::checkpoint::add(
            &db.pool,
            &tasks[0].id,
            caw_db::models::CheckpointType::Progress,
            summary,
            None,
            None,
        )
        .await
        .unwrap();
        assert_eq!(cp.sequence, (index + 1) as i64);
    }

    let listed = caw_core::services::checkpoint::list(&db.pool, &tasks[0].id, None, None, None)
        .await
        .unwrap();
    assert_eq!(listed.len(), 3);
    let sequences: Vec<i64> = listed.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    // since_sequence + limit window.
    let window = caw_core::services::checkpoint::list(&db.pool, &tasks[0].id, None, Some(1), Some(1))
        .await
        .unwrap();
    assert_eq!(window.len(), 1);
    assert_eq!(window[0].sequence, 2);
}
