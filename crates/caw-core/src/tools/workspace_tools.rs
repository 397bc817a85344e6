//! `workspace_*` tools.

use serde::Deserialize;

use caw_db::models::WorkspaceStatus;

use crate::services::workspace;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct CreateArgs {
    workflow_id: String,
    path: String,
    branch: String,
    #[serde(default = "default_base_branch")]
    base_branch: String,
}

fn default_base_branch() -> String {
    "main".to_string()
}

#[derive(Deserialize)]
struct UpdateArgs {
    workspace_id: String,
    #[serde(default)]
    status: Option<WorkspaceStatus>,
    #[serde(default)]
    pr_url: Option<String>,
    #[serde(default)]
    merge_commit: Option<String>,
}

#[derive(Deserialize)]
struct ListArgs {
    #[serde(default)]
    workflow_id: Option<String>,
    #[serde(default)]
    status: Option<WorkspaceStatus>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "workspace_create",
        "Record an active workspace for a workflow",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: CreateArgs = parse_args(args)?;
                let created = workspace::create(
                    &ctx.db,
                    &input.workflow_id,
                    &input.path,
                    &input.branch,
                    &input.base_branch,
                )
                .await?;
                to_value(&created)
            })
        }),
    );

    registry.add(
        "workspace_update",
        "Update status, PR URL, or merge commit",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: UpdateArgs = parse_args(args)?;
                let updated = workspace::update(
                    &ctx.db,
                    &input.workspace_id,
                    input.status,
                    input.pr_url.as_deref(),
                    input.merge_commit.as_deref(),
                )
                .await?;
                to_value(&updated)
            })
        }),
    );

    registry.add(
        "workspace_list",
        "List workspaces, optionally by workflow and status",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ListArgs = parse_args(args)?;
                let workspaces =
                    workspace::list(&ctx.db, input.workflow_id.as_deref(), input.status).await?;
                to_value(&workspaces)
            })
        }),
    );
}
