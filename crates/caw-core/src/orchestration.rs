//! DAG orchestration queries: what runs next, and how far along we are.

use serde::Serialize;
use sqlx::SqlitePool;

use caw_db::models::Task;
use caw_db::queries::tasks as task_db;
pub use caw_db::queries::tasks::WorkflowProgress;

use crate::error::ToolResult;
use crate::services::require_workflow;

/// Result of [`get_next_tasks`].
#[derive(Debug, Clone, Serialize)]
pub struct NextTasks {
    pub tasks: Vec<Task>,
    /// True when no task remains non-terminal.
    pub all_complete: bool,
}

/// Tasks eligible to run now: claimable status (`pending`/`blocked`, plus
/// `failed` when `include_failed`), unassigned, and every dependency
/// terminal. Members of the same `parallel_group` are returned together,
/// ahead of ungrouped tasks that follow them; within a group and between
/// groups the order is by `sequence`.
pub async fn get_next_tasks(
    pool: &SqlitePool,
    workflow_id: &str,
    include_failed: bool,
) -> ToolResult<NextTasks> {
    require_workflow(pool, workflow_id).await?;

    let available =
        task_db::get_available_tasks(pool, workflow_id, include_failed, i64::MAX).await?;
    let all_complete = task_db::all_tasks_terminal(pool, workflow_id).await?;

    // Stable group-aware ordering: the first member of a group (by
    // sequence) anchors the group; later members are pulled forward to sit
    // with it.
    let mut ordered: Vec<Task> = Vec::with_capacity(available.len());
    let mut remaining = available;
    while !remaining.is_empty() {
        let head = remaining.remove(0);
        let group = head.parallel_group.clone();
        ordered.push(head);
        if let Some(group) = group {
            let mut index = 0;
            while index < remaining.len() {
                if remaining[index].parallel_group.as_deref() == Some(group.as_str()) {
                    let sibling = remaining.remove(index);
                    ordered.push(sibling);
                } else {
                    index += 1;
                }
            }
        }
    }

    Ok(NextTasks {
        tasks: ordered,
        all_complete,
    })
}

/// Snapshot of progress for a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub total_tasks: i64,
    pub by_status: WorkflowProgress,
    /// total - (completed + skipped)
    pub estimated_remaining: i64,
}

/// Aggregate task counts by status.
pub async fn get_progress(pool: &SqlitePool, workflow_id: &str) -> ToolResult<Progress> {
    require_workflow(pool, workflow_id).await?;
    let by_status = task_db::get_progress(pool, workflow_id).await?;
    Ok(Progress {
        total_tasks: by_status.total,
        estimated_remaining: by_status.total - (by_status.completed + by_status.skipped),
        by_status,
    })
}
