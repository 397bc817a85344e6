//! `template_*` tools.

use std::collections::HashMap;

use serde::Deserialize;

use crate::services::template;
use crate::services::template::CreateTemplate;

use super::{ToolRegistry, parse_args, to_value};

#[derive(Deserialize)]
struct ApplyArgs {
    template: String,
    workflow_name: String,
    #[serde(default)]
    variables: HashMap<String, String>,
}

pub fn register(registry: &mut ToolRegistry) {
    registry.add(
        "template_create",
        "Create a reusable plan template",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: CreateTemplate = parse_args(args)?;
                let created = template::create(&ctx.db, &input).await?;
                to_value(&created)
            })
        }),
    );

    registry.add(
        "template_list",
        "All templates",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let _: serde_json::Value = args;
                let templates = template::list(&ctx.db).await?;
                to_value(&templates)
            })
        }),
    );

    registry.add(
        "template_apply",
        "Instantiate a workflow from a template",
        Box::new(|ctx, args| {
            Box::pin(async move {
                let input: ApplyArgs = parse_args(args)?;
                let (workflow, tasks) = template::apply(
                    &ctx.db,
                    &input.template,
                    &input.workflow_name,
                    &input.variables,
                )
                .await?;
                let mut value = to_value(&workflow)?;
                value["tasks"] = to_value(&tasks)?;
                Ok(value)
            })
        }),
    );
}
