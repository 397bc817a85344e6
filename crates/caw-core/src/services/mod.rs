//! Entity services: CRUD-plus-domain operations over the store.
//!
//! Conventions shared by every service:
//! - inputs are validated against the closed enums and referential
//!   integrity before any write;
//! - mutations bump `updated_at`;
//! - multi-step mutations run inside one transaction;
//! - failures surface as [`ToolError`](crate::error::ToolError) with exact
//!   codes -- nothing partial-writes silently.

pub mod agent;
pub mod checkpoint;
pub mod lock;
pub mod message;
pub mod repository;
pub mod session;
pub mod task;
pub mod template;
pub mod workflow;
pub mod workspace;

use sqlx::SqlitePool;

use caw_db::models::{Agent, Task, Workflow};
use caw_db::queries::{agents as agent_db, tasks as task_db, workflows as workflow_db};

use crate::error::{ErrorCode, ToolError, ToolResult};

/// Fetch a workflow or fail with `WORKFLOW_NOT_FOUND`.
pub(crate) async fn require_workflow(pool: &SqlitePool, id: &str) -> ToolResult<Workflow> {
    workflow_db::get_workflow(pool, id)
        .await?
        .ok_or_else(|| ToolError::new(ErrorCode::WorkflowNotFound, format!("workflow {id} not found")))
}

/// Fetch a task or fail with `TASK_NOT_FOUND`.
pub(crate) async fn require_task(pool: &SqlitePool, id: &str) -> ToolResult<Task> {
    task_db::get_task(pool, id)
        .await?
        .ok_or_else(|| ToolError::new(ErrorCode::TaskNotFound, format!("task {id} not found")))
}

/// Fetch an agent or fail with `AGENT_NOT_FOUND`.
pub(crate) async fn require_agent(pool: &SqlitePool, id: &str) -> ToolResult<Agent> {
    agent_db::get_agent(pool, id)
        .await?
        .ok_or_else(|| ToolError::new(ErrorCode::AgentNotFound, format!("agent {id} not found")))
}
