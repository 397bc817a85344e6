//! Spawner lifecycle events and the listener registry.
//!
//! Delivery is synchronous and best-effort: a listener that panics never
//! takes the spawner down, and listener ordering within a kind is
//! registration order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

/// Everything the spawner reports to the outside world.
#[derive(Debug, Clone)]
pub enum SpawnerEvent {
    AgentStarted {
        workflow_id: String,
        task_id: String,
        agent_id: String,
    },
    AgentCompleted {
        workflow_id: String,
        task_id: String,
        agent_id: String,
    },
    AgentFailed {
        workflow_id: String,
        task_id: String,
        error: String,
    },
    AgentRetrying {
        workflow_id: String,
        task_id: String,
        attempt: u32,
    },
    AgentQuery {
        workflow_id: String,
        task_id: String,
        message_id: String,
    },
    AgentStagnation {
        workflow_id: String,
        task_id: String,
        level: String,
    },
    WorkflowAllComplete {
        workflow_id: String,
    },
    WorkflowAwaitingMerge {
        workflow_id: String,
        pr_urls: Vec<String>,
    },
    WorkflowStalled {
        workflow_id: String,
        reason: String,
    },
    WorkflowFailed {
        workflow_id: String,
        error: String,
    },
}

/// Discriminant used as the listener-map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStarted,
    AgentCompleted,
    AgentFailed,
    AgentRetrying,
    AgentQuery,
    AgentStagnation,
    WorkflowAllComplete,
    WorkflowAwaitingMerge,
    WorkflowStalled,
    WorkflowFailed,
}

impl SpawnerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AgentStarted { .. } => EventKind::AgentStarted,
            Self::AgentCompleted { .. } => EventKind::AgentCompleted,
            Self::AgentFailed { .. } => EventKind::AgentFailed,
            Self::AgentRetrying { .. } => EventKind::AgentRetrying,
            Self::AgentQuery { .. } => EventKind::AgentQuery,
            Self::AgentStagnation { .. } => EventKind::AgentStagnation,
            Self::WorkflowAllComplete { .. } => EventKind::WorkflowAllComplete,
            Self::WorkflowAwaitingMerge { .. } => EventKind::WorkflowAwaitingMerge,
            Self::WorkflowStalled { .. } => EventKind::WorkflowStalled,
            Self::WorkflowFailed { .. } => EventKind::WorkflowFailed,
        }
    }

    /// Whether this event ends the workflow run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.kind(),
            EventKind::WorkflowAllComplete
                | EventKind::WorkflowAwaitingMerge
                | EventKind::WorkflowStalled
                | EventKind::WorkflowFailed
        )
    }
}

type Listener = Arc<dyn Fn(&SpawnerEvent) + Send + Sync>;

/// Listener sets keyed by event kind, plus catch-all listeners.
#[derive(Default)]
pub struct EventListeners {
    by_kind: Mutex<HashMap<EventKind, Vec<Listener>>>,
    all: Mutex<Vec<Listener>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind.
    pub fn on(&self, kind: EventKind, listener: impl Fn(&SpawnerEvent) + Send + Sync + 'static) {
        self.by_kind
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Register a listener for every event.
    pub fn on_any(&self, listener: impl Fn(&SpawnerEvent) + Send + Sync + 'static) {
        self.all
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(listener));
    }

    /// Deliver an event synchronously. A panicking listener is swallowed.
    pub fn emit(&self, event: &SpawnerEvent) {
        let targeted: Vec<Listener> = {
            let map = self.by_kind.lock().unwrap_or_else(|e| e.into_inner());
            map.get(&event.kind()).cloned().unwrap_or_default()
        };
        let catch_all: Vec<Listener> = {
            self.all.lock().unwrap_or_else(|e| e.into_inner()).clone()
        };

        for listener in targeted.iter().chain(catch_all.iter()) {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(event)));
            if result.is_err() {
                tracing::warn!(kind = ?event.kind(), "event listener panicked, ignoring");
            }
        }
    }
}
