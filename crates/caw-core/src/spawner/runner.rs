//! Workflow runner: a thin facade over the spawner that wires a reporter,
//! awaits a single terminal event, and returns a tagged outcome.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::oneshot;
use tracing::info;

use crate::error::ToolResult;
use crate::spawner::WorkflowSpawner;
use crate::spawner::events::SpawnerEvent;

/// How a run ended (or that it was detached).
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed,
    AwaitingMerge { pr_urls: Vec<String> },
    Failed { error: String },
    Stalled { reason: String },
    Detached,
}

/// Caller-supplied observation hooks.
pub struct RunnerOptions {
    /// Receives every spawner event, synchronously.
    pub reporter: Option<Arc<dyn Fn(&SpawnerEvent) + Send + Sync>>,
    /// Return immediately after `start()`.
    pub detach: bool,
    /// Runs after an `awaiting_merge` classification, before shutdown.
    pub on_awaiting_merge: Option<Arc<dyn Fn(&[String]) + Send + Sync>>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            reporter: None,
            detach: false,
            on_awaiting_merge: None,
        }
    }
}

/// Run a workflow to a terminal state (or detach).
pub async fn run_workflow(
    spawner: Arc<WorkflowSpawner>,
    options: RunnerOptions,
) -> ToolResult<WorkflowOutcome> {
    if let Some(reporter) = options.reporter.clone() {
        spawner.listeners().on_any(move |event| reporter(event));
    }

    // One-shot terminal signal: the first terminal event wins, later ones
    // find the sender gone and are ignored.
    let (tx, rx) = oneshot::channel::<WorkflowOutcome>();
    let slot = Arc::new(StdMutex::new(Some(tx)));
    {
        let slot = Arc::clone(&slot);
        spawner.listeners().on_any(move |event| {
            let outcome = match event {
                SpawnerEvent::WorkflowAllComplete { .. } => Some(WorkflowOutcome::Completed),
                SpawnerEvent::WorkflowAwaitingMerge { pr_urls, .. } => {
                    Some(WorkflowOutcome::AwaitingMerge {
                        pr_urls: pr_urls.clone(),
                    })
                }
                SpawnerEvent::WorkflowFailed { error, .. } => Some(WorkflowOutcome::Failed {
                    error: error.clone(),
                }),
                SpawnerEvent::WorkflowStalled { reason, .. } => Some(WorkflowOutcome::Stalled {
                    reason: reason.clone(),
                }),
                _ => None,
            };
            if let Some(outcome) = outcome {
                if let Some(tx) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(outcome);
                }
            }
        });
    }

    spawner.start().await?;

    if options.detach {
        return Ok(WorkflowOutcome::Detached);
    }

    let outcome = match rx.await {
        Ok(outcome) => outcome,
        Err(_) => WorkflowOutcome::Stalled {
            reason: "spawner dropped without a terminal event".to_string(),
        },
    };

    if let WorkflowOutcome::AwaitingMerge { pr_urls } = &outcome {
        if let Some(hook) = &options.on_awaiting_merge {
            hook(pr_urls);
        }
    }

    spawner.shutdown().await;
    info!(workflow_id = %spawner.workflow_id(), outcome = ?outcome, "workflow run finished");
    Ok(outcome)
}
