//! The tool surface end to end: dispatch, error shapes, messaging, and
//! repository idempotence.

mod common;

use std::sync::Arc;

use caw_core::spawner::registry::SpawnerRegistry;
use caw_core::tools::{ToolContext, ToolRegistry};
use caw_test_utils::create_test_db;
use serde_json::json;

use common::MockLauncher;

struct Fixture {
    registry: ToolRegistry,
    ctx: Arc<ToolContext>,
    _db: caw_test_utils::TestDb,
}

async fn fixture() -> Fixture {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let ctx = Arc::new(ToolContext {
        db: db.pool.clone(),
        registry: Arc::new(SpawnerRegistry::new()),
        launcher,
        mcp_port: 3100,
    });
    Fixture {
        registry: ToolRegistry::new(),
        ctx,
        _db: db,
    }
}

impl Fixture {
    async fn call(&self, name: &str, args: serde_json::Value) -> serde_json::Value {
        self.registry
            .dispatch(&self.ctx, name, args)
            .await
            .unwrap_or_else(|| panic!("unknown tool {name}"))
            .expect("tool call failed")
    }

    async fn call_err(&self, name: &str, args: serde_json::Value) -> serde_json::Value {
        self.registry
            .dispatch(&self.ctx, name, args)
            .await
            .unwrap_or_else(|| panic!("unknown tool {name}"))
            .expect_err("tool call unexpectedly succeeded")
    }
}

#[tokio::test]
async fn unknown_tool_is_none() {
    let f = fixture().await;
    let result = f.registry.dispatch(&f.ctx, "workflow_explode", json!({})).await;
    assert!(result.is_none());
}

#[tokio::test]
async fn create_plan_and_drive_a_task_through_tools() {
    let f = fixture().await;

    let workflow = f
        .call("workflow_create", json!({ "name": "via tools", "max_parallel_tasks": 2 }))
        .await;
    let workflow_id = workflow["id"].as_str().unwrap().to_string();
    assert_eq!(workflow["status"], "planning");
    assert!(workflow_id.starts_with("wf_"));

    let tasks = f
        .call(
            "workflow_set_plan",
            json!({
                "workflow_id": workflow_id,
                "summary": "two steps",
                "tasks": [
                    { "name": "first", "description": "step one" },
                    { "name": "second", "depends_on": ["first"] },
                ],
            }),
        )
        .await;
    let first_id = tasks[0]["id"].as_str().unwrap().to_string();
    assert_eq!(tasks[1]["status"], "blocked");

    let agent = f
        .call("agent_register", json!({ "name": "worker-1", "workflow_id": workflow_id }))
        .await;
    let agent_id = agent["id"].as_str().unwrap().to_string();
    assert!(agent_id.starts_with("ag_"));

    let claim = f
        .call("task_claim", json!({ "task_id": first_id, "agent_id": agent_id }))
        .await;
    assert_eq!(claim["success"], true);

    // Losing claim returns data, not an error.
    let rival = f.call("agent_register", json!({ "name": "worker-2" })).await;
    let lost = f
        .call(
            "task_claim",
            json!({ "task_id": first_id, "agent_id": rival["id"].as_str().unwrap() }),
        )
        .await;
    assert_eq!(lost["success"], false);
    assert_eq!(lost["already_claimed_by"], agent_id.as_str());

    f.call(
        "task_update_status",
        json!({ "task_id": first_id, "status": "in_progress" }),
    )
    .await;
    f.call(
        "checkpoint_add",
        json!({
            "task_id": first_id,
            "type": "progress",
            "summary": "halfway there",
            "files": ["src/lib.rs"],
        }),
    )
    .await;
    let done = f
        .call(
            "task_update_status",
            json!({ "task_id": first_id, "status": "completed", "outcome": "step one shipped" }),
        )
        .await;
    assert_eq!(done["status"], "completed");

    let checkpoints = f
        .call("checkpoint_list", json!({ "task_id": first_id }))
        .await;
    assert_eq!(checkpoints.as_array().unwrap().len(), 1);
    assert_eq!(checkpoints[0]["sequence"], 1);

    let next = f
        .call("workflow_next_tasks", json!({ "workflow_id": workflow_id }))
        .await;
    assert_eq!(next["all_complete"], false);
    assert_eq!(next["tasks"][0]["name"], "second");

    let progress = f
        .call("workflow_progress", json!({ "workflow_id": workflow_id }))
        .await;
    assert_eq!(progress["total_tasks"], 2);
    assert_eq!(progress["by_status"]["completed"], 1);
    assert_eq!(progress["estimated_remaining"], 1);
}

#[tokio::test]
async fn error_bodies_carry_the_fixed_shape() {
    let f = fixture().await;

    let error = f
        .call_err("workflow_get", json!({ "workflow_id": "wf_missing" }))
        .await;
    assert_eq!(error["code"], "WORKFLOW_NOT_FOUND");
    assert_eq!(error["recoverable"], true);
    assert!(error["suggestion"].as_str().unwrap().contains("workflow_list"));
    assert!(error["message"].as_str().unwrap().contains("wf_missing"));

    // Malformed input maps to INVALID_INPUT, not a transport failure.
    let error = f.call_err("workflow_create", json!({ "name": 42 })).await;
    assert_eq!(error["code"], "INVALID_INPUT");

    let error = f
        .call_err("task_update_status", json!({ "task_id": "tk_x", "status": "sideways" }))
        .await;
    assert_eq!(error["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn repository_registration_is_idempotent() {
    let f = fixture().await;

    let first = f
        .call("repository_register", json!({ "path": "/srv/acme", "name": "acme" }))
        .await;
    let second = f
        .call("repository_register", json!({ "path": "/srv/acme" }))
        .await;
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["name"], "acme");

    let error = f.call_err("repository_register", json!({ "path": "  " })).await;
    assert_eq!(error["code"], "MISSING_REPO_PATH");

    let by_path = f
        .call("repository_get", json!({ "repository": "/srv/acme" }))
        .await;
    assert_eq!(by_path["id"], first["id"]);
}

#[tokio::test]
async fn workspace_merge_requires_commit() {
    let f = fixture().await;
    let workflow = f.call("workflow_create", json!({ "name": "ws" })).await;
    let workflow_id = workflow["id"].as_str().unwrap();

    let workspace = f
        .call(
            "workspace_create",
            json!({
                "workflow_id": workflow_id,
                "path": "/tmp/wt",
                "branch": "caw/ws/task",
            }),
        )
        .await;
    let workspace_id = workspace["id"].as_str().unwrap();
    assert_eq!(workspace["status"], "active");
    assert_eq!(workspace["base_branch"], "main");

    let error = f
        .call_err(
            "workspace_update",
            json!({ "workspace_id": workspace_id, "status": "merged" }),
        )
        .await;
    assert_eq!(error["code"], "MISSING_MERGE_COMMIT");

    let merged = f
        .call(
            "workspace_update",
            json!({
                "workspace_id": workspace_id,
                "status": "merged",
                "merge_commit": "abc123",
            }),
        )
        .await;
    assert_eq!(merged["status"], "merged");
}

#[tokio::test]
async fn messaging_roundtrip_with_structured_bodies() {
    let f = fixture().await;

    let alice = f.call("agent_register", json!({ "name": "alice" })).await;
    let bob = f.call("agent_register", json!({ "name": "bob" })).await;
    let alice_id = alice["id"].as_str().unwrap();
    let bob_id = bob["id"].as_str().unwrap();

    // Unknown recipient and sender get their own codes.
    let error = f
        .call_err(
            "message_send",
            json!({ "sender_id": alice_id, "recipient_id": "ag_ghost", "body": "hi" }),
        )
        .await;
    assert_eq!(error["code"], "RECIPIENT_NOT_FOUND");
    let error = f
        .call_err(
            "message_send",
            json!({ "sender_id": "ag_ghost", "recipient_id": bob_id, "body": "hi" }),
        )
        .await;
    assert_eq!(error["code"], "SENDER_NOT_FOUND");

    // An object body is stored as canonical JSON text.
    let sent = f
        .call(
            "message_send",
            json!({
                "sender_id": alice_id,
                "recipient_id": bob_id,
                "message_type": "query",
                "subject": "need a decision",
                "body": { "question": "merge strategy?", "options": ["squash", "rebase"] },
                "priority": "high",
            }),
        )
        .await;
    let stored: serde_json::Value = serde_json::from_str(sent["body"].as_str().unwrap()).unwrap();
    assert_eq!(stored["question"], "merge strategy?");

    let count = f
        .call("message_count_unread", json!({ "agent_id": bob_id }))
        .await;
    assert_eq!(count["unread"], 1);

    let fetched = f
        .call(
            "message_get",
            json!({ "message_id": sent["id"].as_str().unwrap(), "mark_read": true }),
        )
        .await;
    assert_eq!(fetched["status"], "read");

    let count = f
        .call(
            "message_count_unread",
            json!({ "agent_id": bob_id, "priorities": ["high", "urgent"] }),
        )
        .await;
    assert_eq!(count["unread"], 0);

    // Broadcast reaches everyone online except the sender.
    let broadcast = f
        .call(
            "message_broadcast",
            json!({ "sender_id": alice_id, "subject": "heads up", "body": "pausing soon" }),
        )
        .await;
    assert_eq!(broadcast["sent"], 1);

    let inbox = f
        .call("message_list", json!({ "agent_id": bob_id, "status": "unread" }))
        .await;
    assert_eq!(inbox.as_array().unwrap().len(), 1);
    assert_eq!(inbox[0]["message_type"], "broadcast");
}
