//! Plan installation, validation errors, add/remove, and replanning.

mod common;

use caw_db::models::{TaskStatus, WorkflowStatus};
use caw_db::queries::tasks as task_db;
use caw_core::error::ErrorCode;
use caw_core::services::workflow::{self, ReplanInput};
use caw_core::services::task;
use caw_test_utils::create_test_db;

use common::{seed_workflow, spec};

#[tokio::test]
async fn set_plan_moves_workflow_to_ready_and_blocks_dependents() {
    let db = create_test_db().await;
    let (workflow_id, tasks) = seed_workflow(
        &db.pool,
        "plan",
        1,
        &[spec("a", &[]), spec("b", &["a"]), spec("c", &["a", "b"])],
    )
    .await;

    let (workflow, _) = workflow::get(&db.pool, &workflow_id, false).await.unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Ready);

    assert_eq!(tasks[0].status, TaskStatus::Pending);
    assert_eq!(tasks[1].status, TaskStatus::Blocked);
    assert_eq!(tasks[2].status, TaskStatus::Blocked);

    // IP.3: sequence is 1..N without gaps.
    let sequences: Vec<i64> = tasks.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);
}

#[tokio::test]
async fn set_plan_rejected_outside_planning_status() {
    let db = create_test_db().await;
    let (workflow_id, _) = seed_workflow(&db.pool, "ready", 1, &[spec("a", &[])]).await;

    // The workflow is now `ready`; a second set_plan must fail.
    let err = workflow::set_plan(&db.pool, &workflow_id, "again", &[spec("x", &[])])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidState);
    assert!(!err.code.recoverable());
}

#[tokio::test]
async fn set_plan_validation_errors() {
    let db = create_test_db().await;

    let make = |name: &str| workflow::CreateWorkflow {
        name: name.to_string(),
        source: caw_db::models::WorkflowSource::Prompt,
        source_reference: None,
        source_content: None,
        max_parallel_tasks: 1,
        auto_create_workspaces: false,
    };

    // Duplicate task name.
    let wf = workflow::create(&db.pool, &make("dups")).await.unwrap();
    let err = workflow::set_plan(&db.pool, &wf.id, "s", &[spec("a", &[]), spec("a", &[])])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateTaskName);
    assert!(err.code.recoverable());

    // Self dependency.
    let wf = workflow::create(&db.pool, &make("selfdep")).await.unwrap();
    let err = workflow::set_plan(&db.pool, &wf.id, "s", &[spec("circular", &["circular"])])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SelfDependency);

    // Unknown dependency.
    let wf = workflow::create(&db.pool, &make("unknown")).await.unwrap();
    let err = workflow::set_plan(&db.pool, &wf.id, "s", &[spec("a", &["ghost"])])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownDependency);

    // A failed plan leaves no tasks behind.
    let tasks = task_db::list_tasks_for_workflow(&db.pool, &wf.id).await.unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn add_and_remove_task_keep_sequences_gap_free() {
    let db = create_test_db().await;
    let (workflow_id, tasks) =
        seed_workflow(&db.pool, "addremove", 1, &[spec("a", &[]), spec("b", &[])]).await;

    let added = workflow::add_task(&db.pool, &workflow_id, &spec("c", &["a"])).await.unwrap();
    assert_eq!(added.sequence, 3);
    assert_eq!(added.status, TaskStatus::Blocked);

    workflow::remove_task(&db.pool, &tasks[0].id).await.unwrap();

    let remaining = task_db::list_tasks_for_workflow(&db.pool, &workflow_id).await.unwrap();
    let sequences: Vec<i64> = remaining.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);
    assert_eq!(remaining.len(), 2);
}

#[tokio::test]
async fn remove_task_refuses_started_tasks() {
    let db = create_test_db().await;
    let (_workflow_id, tasks) = seed_workflow(&db.pool, "started", 1, &[spec("a", &[])]).await;

    // Claim and start the task; it becomes non-removable.
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

    let err = workflow::remove_task(&db.pool, &tasks[0].id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TaskNotRemovable);
}

#[tokio::test]
async fn replan_preserves_started_tasks_and_appends_new_ones() {
    let db = create_test_db().await;
    let (workflow_id, tasks) = seed_workflow(
        &db.pool,
        "replan",
        1,
        &[spec("keep", &[]), spec("drop", &["keep"])],
    )
    .await;

    // Start "keep" so it must survive the replan.
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

    let new_tasks = workflow::replan(
        &db.pool,
        &workflow_id,
        &ReplanInput {
            summary: "new direction".to_string(),
            reason: Some("requirements changed".to_string()),
            tasks: vec![spec("fresh", &["keep"])],
        },
    )
    .await
    .unwrap();

    let names: Vec<&str> = new_tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["keep", "fresh"]);
    let sequences: Vec<i64> = new_tasks.iter().map(|t| t.sequence).collect();
    assert_eq!(sequences, vec![1, 2]);

    // The preserved task keeps its id; the dropped one is gone.
    assert_eq!(new_tasks[0].id, tasks[0].id);
    assert!(task_db::get_task(&db.pool, &tasks[1].id).await.unwrap().is_none());

    // Both surviving tasks got a replan checkpoint.
    for t in &new_tasks {
        let checkpoints = caw_core::services::checkpoint::list(&db.pool, &t.id, None, None, None)
            .await
            .unwrap();
        assert!(
            checkpoints
                .iter()
                .any(|c| c.checkpoint_type == caw_db::models::CheckpointType::Replan),
            "task {} missing replan checkpoint",
            t.name
        );
    }
}

#[tokio::test]
async fn replan_name_conflict_with_preserved_task() {
    let db = create_test_db().await;
    let (workflow_id, tasks) = seed_workflow(&db.pool, "conflict", 1, &[spec("keep", &[])]).await;

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

    let err = workflow::replan(
        &db.pool,
        &workflow_id,
        &ReplanInput {
            summary: "s".to_string(),
            reason: None,
            tasks: vec![spec("keep", &[])],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::NameConflict);
}

#[tokio::test]
async fn replan_dependency_errors() {
    let db = create_test_db().await;
    let (workflow_id, _tasks) = seed_workflow(&db.pool, "repdeps", 1, &[spec("a", &[])]).await;

    let err = workflow::replan(
        &db.pool,
        &workflow_id,
        &ReplanInput {
            summary: "s".to_string(),
            reason: None,
            tasks: vec![spec("x", &["nonexistent"])],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::UnknownDependency);

    let err = workflow::replan(
        &db.pool,
        &workflow_id,
        &ReplanInput {
            summary: "s".to_string(),
            reason: None,
            tasks: vec![spec("x", &["x"])],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::SelfDependency);

    let err = workflow::replan(
        &db.pool,
        &workflow_id,
        &ReplanInput {
            summary: "s".to_string(),
            reason: None,
            tasks: vec![spec("x", &[]), spec("x", &[])],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateTaskName);
}

#[tokio::test]
async fn template_roundtrip_reproduces_plan_shape() {
    let db = create_test_db().await;
    let (workflow_id, _tasks) = seed_workflow(
        &db.pool,
        "templated",
        1,
        &[spec("build", &[]), spec("test", &["build"])],
    )
    .await;

    let template = caw_core::services::template::create(
        &db.pool,
        &caw_core::services::template::CreateTemplate {
            name: "ci-plan".to_string(),
            description: None,
            tasks: None,
            from_workflow_id: Some(workflow_id),
            variables: vec![],
        },
    )
    .await
    .unwrap();

    let (applied, applied_tasks) = caw_core::services::template::apply(
        &db.pool,
        &template.id,
        "templated again",
        &Default::default(),
    )
    .await
    .unwrap();

    assert_eq!(applied.status, WorkflowStatus::Ready);
    let names: Vec<&str> = applied_tasks.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["build", "test"]);

    // The dependency edge survived by name.
    let deps = task_db::get_dependencies(&db.pool, &applied_tasks[1].id).await.unwrap();
    assert_eq!(deps.len(), 1);
    assert_eq!(deps[0].name, "build");
}

#[tokio::test]
async fn template_apply_requires_all_variables() {
    let db = create_test_db().await;

    caw_core::services::template::create(
        &db.pool,
        &caw_core::services::template::CreateTemplate {
            name: "varful".to_string(),
            description: None,
            tasks: Some(vec![caw_core::services::template::TemplateTask {
                name: "port {{service}}".to_string(),
                description: "move {{service}} to {{lang}}".to_string(),
                parallel_group: None,
                depends_on: vec![],
            }]),
            from_workflow_id: None,
            variables: vec!["service".to_string(), "lang".to_string()],
        },
    )
    .await
    .unwrap();

    let err = caw_core::services::template::apply(
        &db.pool,
        "varful",
        "wf",
        &std::collections::HashMap::from([("service".to_string(), "auth".to_string())]),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::MissingVariables);
    assert!(err.message.contains("lang"));

    // Duplicate template names are rejected.
    let err = caw_core::services::template::create(
        &db.pool,
        &caw_core::services::template::CreateTemplate {
            name: "varful".to_string(),
            description: None,
            tasks: Some(vec![]),
            from_workflow_id: None,
            variables: vec![],
        },
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::DuplicateTemplate);
}
