//! The RPC tool surface: 56 named operations over the entity services.
//!
//! Registration is table-driven; every handler runs inside a common
//! harness that returns a [`ToolError`] verbatim and wraps anything else
//! as `INTERNAL_ERROR`. Lock-sensitive plan mutations run the workflow
//! lock guard before dispatch.

mod agent_tools;
mod checkpoint_tools;
mod message_tools;
mod repository_tools;
mod task_tools;
mod template_tools;
mod workflow_tools;
mod workspace_tools;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use sqlx::SqlitePool;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::spawner::launcher::AgentLauncher;
use crate::spawner::registry::SpawnerRegistry;

/// Shared dependencies every handler sees.
pub struct ToolContext {
    pub db: SqlitePool,
    pub registry: Arc<SpawnerRegistry>,
    pub launcher: Arc<dyn AgentLauncher>,
    pub mcp_port: u16,
}

type HandlerFuture = Pin<Box<dyn Future<Output = ToolResult<serde_json::Value>> + Send>>;
type Handler = Box<dyn Fn(Arc<ToolContext>, serde_json::Value) -> HandlerFuture + Send + Sync>;

/// Static description of one tool.
pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
}

/// Name-keyed tool table.
pub struct ToolRegistry {
    tools: HashMap<&'static str, (ToolDef, Handler)>,
}

impl ToolRegistry {
    /// Build the full 56-tool surface.
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        workflow_tools::register(&mut registry);
        task_tools::register(&mut registry);
        checkpoint_tools::register(&mut registry);
        workspace_tools::register(&mut registry);
        repository_tools::register(&mut registry);
        template_tools::register(&mut registry);
        agent_tools::register(&mut registry);
        message_tools::register(&mut registry);
        registry
    }

    pub(crate) fn add(&mut self, name: &'static str, description: &'static str, handler: Handler) {
        let def = ToolDef { name, description };
        let previous = self.tools.insert(name, (def, handler));
        debug_assert!(previous.is_none(), "duplicate tool name {name}");
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// All tool definitions, sorted by name.
    pub fn list(&self) -> Vec<&ToolDef> {
        let mut defs: Vec<&ToolDef> = self.tools.values().map(|(def, _)| def).collect();
        defs.sort_by_key(|d| d.name);
        defs
    }

    /// Dispatch a call through the common harness. `None` means the tool
    /// name is unknown (the transport turns that into "method not found").
    ///
    /// The harness contract: a `ToolError` is serialised verbatim; any
    /// other failure inside a handler has already been mapped to
    /// `INTERNAL_ERROR` by the `?` conversions on the way out.
    pub async fn dispatch(
        &self,
        ctx: &Arc<ToolContext>,
        name: &str,
        args: serde_json::Value,
    ) -> Option<Result<serde_json::Value, serde_json::Value>> {
        let (_, handler) = self.tools.get(name)?;
        let result = handler(Arc::clone(ctx), args).await;
        Some(match result {
            Ok(value) => Ok(value),
            Err(err) => Err(err.to_value()),
        })
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserialize tool arguments, mapping failures to `INVALID_INPUT`.
pub(crate) fn parse_args<T: DeserializeOwned>(args: serde_json::Value) -> ToolResult<T> {
    serde_json::from_value(args)
        .map_err(|e| ToolError::new(ErrorCode::InvalidInput, format!("invalid input: {e}")))
}

/// Serialize a handler result, mapping failures to `INTERNAL_ERROR`.
pub(crate) fn to_value<T: serde::Serialize>(value: &T) -> ToolResult<serde_json::Value> {
    serde_json::to_value(value).map_err(ToolError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_the_full_surface() {
        let registry = ToolRegistry::new();
        assert_eq!(registry.len(), 56, "expected the 56-tool surface");
    }

    #[test]
    fn registry_knows_core_tools() {
        let registry = ToolRegistry::new();
        for name in [
            "workflow_create",
            "workflow_set_plan",
            "workflow_replan",
            "workflow_start",
            "task_claim",
            "task_release",
            "checkpoint_add",
            "message_send",
            "agent_register",
            "template_apply",
            "repository_register",
            "workspace_update",
        ] {
            assert!(registry.contains(name), "missing tool {name}");
        }
        assert!(!registry.contains("workflow_delete"));
    }

    #[test]
    fn list_is_sorted_and_complete() {
        let registry = ToolRegistry::new();
        let names: Vec<&str> = registry.list().iter().map(|d| d.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert_eq!(names.len(), 56);
    }
}
