//! Streamable HTTP transport with per-session routing.
//!
//! `POST /mcp` carries one JSON-RPC request. A request without an
//! `mcp-session-id` header opens a new session whose id is echoed back in
//! the response header; subsequent requests present the header to route to
//! it. `GET`/`DELETE /mcp` without a known session return 400 with a
//! JSON-RPC `-32000` error body. `GET /health` answers `OK`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header::HeaderName};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use caw_db::ids;
use caw_db::now_ms;

use crate::rpc::jsonrpc;
use crate::tools::{ToolContext, ToolRegistry};

pub const SESSION_HEADER: &str = "mcp-session-id";

/// One transport session. Each session logically owns its own server pair;
/// the registry and context are shared, so the per-session state is the
/// identity and bookkeeping.
#[derive(Debug, Clone)]
struct SessionTransport {
    last_seen: i64,
}

#[derive(Clone)]
pub struct HttpState {
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    sessions: Arc<StdMutex<HashMap<String, SessionTransport>>>,
}

impl HttpState {
    pub fn new(registry: Arc<ToolRegistry>, ctx: Arc<ToolContext>) -> Self {
        Self {
            registry,
            ctx,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn session_count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Build the transport router.
pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/mcp", axum::routing::post(post_mcp).get(get_mcp).delete(delete_mcp))
        .route("/health", get(health))
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until cancelled.
pub async fn run_http(
    registry: Arc<ToolRegistry>,
    ctx: Arc<ToolContext>,
    port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let state = HttpState::new(registry, ctx);
    let app = build_router(state);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("caw rpc listening on http://{addr}/mcp");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("caw rpc shut down");
    Ok(())
}

fn bad_session_response() -> Response {
    let body = jsonrpc::error_response(None, jsonrpc::BAD_SESSION, "Bad Request: No active session");
    (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
}

async fn post_mcp(State(state): State<HttpState>, headers: HeaderMap, body: String) -> Response {
    let presented = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let now = now_ms();
    let session_id = match presented {
        Some(session_id) => {
            let mut sessions = state.sessions.lock().unwrap_or_else(|e| e.into_inner());
            match sessions.get_mut(&session_id) {
                Some(session) => {
                    session.last_seen = now;
                    session_id
                }
                None => return bad_session_response(),
            }
        }
        None => {
            // Fresh session: create a transport pair and hand out the id.
            let session_id = ids::generate(ids::prefix::SESSION);
            state
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(session_id.clone(), SessionTransport { last_seen: now });
            debug!(session_id = %session_id, total = state.session_count(), "new rpc session");
            session_id
        }
    };

    let response_body = match jsonrpc::parse_request(&body) {
        Ok(request) => jsonrpc::handle_request(&state.registry, &state.ctx, request).await,
        Err(error) => error,
    };

    let mut response = (StatusCode::OK, axum::Json(response_body)).into_response();
    if let Ok(value) = session_id.parse() {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

async fn get_mcp(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    match known_session(&state, &headers) {
        // Server-push streaming is not offered; a live session gets an
        // explicit method rejection rather than a hanging stream.
        true => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        false => bad_session_response(),
    }
}

async fn delete_mcp(State(state): State<HttpState>, headers: HeaderMap) -> Response {
    let presented = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let Some(session_id) = presented else {
        return bad_session_response();
    };
    let removed = state
        .sessions
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(session_id);
    match removed {
        Some(session) => {
            debug!(session_id, idle_ms = now_ms() - session.last_seen, "rpc session closed");
            StatusCode::OK.into_response()
        }
        None => bad_session_response(),
    }
}

fn known_session(state: &HttpState, headers: &HeaderMap) -> bool {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|id| {
            state
                .sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(id)
        })
}

async fn health() -> &'static str {
    "OK"
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
