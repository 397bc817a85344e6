//! `repository_*` tools.

use serde::Deserialize;

use crate::services::repository;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct RegisterArgs {
    path: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct GetArgs {
    repository: String,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "repository_register",
        "Register a repository path (idempotent)",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: RegisterArgs = parse_args(args)?;
                let registered =
                    repository::register(&ctx.db, &input.path, input.name.as_deref()).await?;
                to_value(&registered)
            })
        }),
    );

    registry.add(
        "repository_list",
        "All registered repositories",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let _: serde_json::Value = args;
                let repositories = repository::list(&ctx.db).await?;
                to_value(&repositories)
            })
        }),
    );

    registry.add(
        "repository_get",
        "Fetch a repository by id or path",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: GetArgs = parse_args(args)?;
                let found = repository::get(&ctx.db, &input.repository).await?;
                to_value(&found)
            })
        }),
    );
}
