//! HTTP transport behaviour: session routing, health, and JSON-RPC edges.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use caw_core::rpc::http::{HttpState, SESSION_HEADER, build_router};
use caw_core::spawner::registry::SpawnerRegistry;
use caw_core::tools::{ToolContext, ToolRegistry};
use caw_test_utils::create_test_db;

use common::MockLauncher;

async fn test_router() -> (axum::Router, caw_test_utils::TestDb) {
    let db = create_test_db().await;
    let launcher = MockLauncher::new(db.pool.clone(), true);
    let ctx = Arc::new(ToolContext {
        db: db.pool.clone(),
        registry: Arc::new(SpawnerRegistry::new()),
        launcher,
        mcp_port: 3100,
    });
    let state = HttpState::new(Arc::new(ToolRegistry::new()), ctx);
    (build_router(state), db)
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn rpc(method: &str, params: serde_json::Value) -> String {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    })
    .to_string()
}

#[tokio::test]
async fn health_answers_ok() {
    let (app, _db) = test_router().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"OK");
}

#[tokio::test]
async fn unknown_path_is_404() {
    let (app, _db) = test_router().await;
    let response = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn post_without_session_creates_one_and_echoes_the_header() {
    let (app, _db) = test_router().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header("content-type", "application/json")
                .body(Body::from(rpc("workflow_list", serde_json::json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let session_id = response
        .headers()
        .get(SESSION_HEADER)
        .expect("session id header missing")
        .to_str()
        .unwrap()
        .to_string();
    assert!(session_id.starts_with("sp_"));

    let json = body_json(response).await;
    assert_eq!(json["jsonrpc"], "2.0");
    assert_eq!(json["result"], serde_json::json!([]));

    // The echoed id routes a follow-up request.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(SESSION_HEADER, &session_id)
                .header("content-type", "application/json")
                .body(Body::from(rpc(
                    "workflow_create",
                    serde_json::json!({ "name": "over http" }),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"]["name"], "over http");
}

#[tokio::test]
async fn post_with_unknown_session_is_rejected() {
    let (app, _db) = test_router().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(SESSION_HEADER, "sp_doesnotexist")
                .body(Body::from(rpc("workflow_list", serde_json::json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32000);
    assert_eq!(json["error"]["message"], "Bad Request: No active session");
}

#[tokio::test]
async fn get_and_delete_without_session_are_bad_requests() {
    let (app, _db) = test_router().await;

    for method in ["GET", "DELETE"] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri("/mcp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{method} /mcp");
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], -32000);
        assert_eq!(json["error"]["message"], "Bad Request: No active session");
    }
}

#[tokio::test]
async fn delete_closes_a_known_session() {
    let (app, _db) = test_router().await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from(rpc("tools/list", serde_json::json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();
    let session_id = response.headers()[SESSION_HEADER].to_str().unwrap().to_string();
    let json = body_json(response).await;
    assert_eq!(json["result"]["tools"].as_array().unwrap().len(), 56);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/mcp")
                .header(SESSION_HEADER, &session_id)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Closed sessions no longer route.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .header(SESSION_HEADER, &session_id)
                .body(Body::from(rpc("workflow_list", serde_json::json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_method_and_tool_errors_over_http() {
    let (app, _db) = test_router().await;

    // Unknown tool name -> JSON-RPC method not found.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from(rpc("workflow_explode", serde_json::json!({}))))
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32601);

    // Tool errors ride inside the result body with an isError flag.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from(rpc(
                    "workflow_get",
                    serde_json::json!({ "workflow_id": "wf_missing" }),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["result"]["isError"], true);
    assert_eq!(json["result"]["code"], "WORKFLOW_NOT_FOUND");

    // tools/call wrapping behaves the same as direct method dispatch.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from(rpc(
                    "tools/call",
                    serde_json::json!({
                        "name": "workflow_create",
                        "arguments": { "name": "wrapped" },
                    }),
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["result"]["name"], "wrapped");

    // Parse errors surface as -32700.
    let (app, _db2) = test_router().await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/mcp")
                .body(Body::from("this is not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], -32700);
}
