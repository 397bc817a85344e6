//! Template service: reusable serialized plans with `{{var}}` placeholders.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use caw_db::models::{Template, Workflow, WorkflowSource};
use caw_db::queries::tasks as task_db;
use caw_db::queries::templates as template_db;

use crate::error::{ErrorCode, ToolError, ToolResult};
use crate::services::workflow::{self, CreateWorkflow, TaskSpec};

/// One task spec stored inside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateTask {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Inputs for [`create`]. Exactly one of `tasks` or `from_workflow_id` is
/// used; an explicit task list wins.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTemplate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tasks: Option<Vec<TemplateTask>>,
    #[serde(default)]
    pub from_workflow_id: Option<String>,
    #[serde(default)]
    pub variables: Vec<String>,
}

/// Create a template from explicit task specs or by snapshotting an
/// existing workflow's plan.
pub async fn create(pool: &SqlitePool, input: &CreateTemplate) -> ToolResult<Template> {
    if input.name.trim().is_empty() {
        return Err(ToolError::new(ErrorCode::InvalidInput, "template name must not be empty"));
    }
    if template_db::get_by_name(pool, &input.name).await?.is_some() {
        return Err(ToolError::new(
            ErrorCode::DuplicateTemplate,
            format!("a template named {:?} already exists", input.name),
        ));
    }

    let tasks: Vec<TemplateTask> = match (&input.tasks, &input.from_workflow_id) {
        (Some(tasks), _) if !tasks.is_empty() => tasks.clone(),
        (_, Some(workflow_id)) => snapshot_workflow(pool, workflow_id).await?,
        _ => {
            return Err(ToolError::new(
                ErrorCode::InvalidInput,
                "template needs either tasks or from_workflow_id",
            ));
        }
    };

    let tasks_json = serde_json::to_string(&tasks).map_err(ToolError::internal)?;
    let variables_json = serde_json::to_string(&input.variables).map_err(ToolError::internal)?;

    Ok(template_db::insert_template(
        pool,
        &input.name,
        input.description.as_deref(),
        &tasks_json,
        &variables_json,
    )
    .await?)
}

/// Capture a workflow's current task names, descriptions, groups, and
/// dependency edges as template specs.
async fn snapshot_workflow(pool: &SqlitePool, workflow_id: &str) -> ToolResult<Vec<TemplateTask>> {
    crate::services::require_workflow(pool, workflow_id).await?;
    let tasks = task_db::list_tasks_for_workflow(pool, workflow_id).await?;
    let edges = task_db::list_edges_for_workflow(pool, workflow_id).await?;

    let id_to_name: HashMap<&str, &str> =
        tasks.iter().map(|t| (t.id.as_str(), t.name.as_str())).collect();

    Ok(tasks
        .iter()
        .map(|task| TemplateTask {
            name: task.name.clone(),
            description: task.description.clone(),
            parallel_group: task.parallel_group.clone(),
            depends_on: edges
                .iter()
                .filter(|(task_id, _)| task_id == &task.id)
                .filter_map(|(_, dep_id)| id_to_name.get(dep_id.as_str()).map(|n| n.to_string()))
                .collect(),
        })
        .collect())
}

/// List all templates.
pub async fn list(pool: &SqlitePool) -> ToolResult<Vec<Template>> {
    Ok(template_db::list_templates(pool).await?)
}

/// Substitute `{{var}}` placeholders, collecting unbound names.
fn substitute(text: &str, variables: &HashMap<String, String>, missing: &mut Vec<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let var = after[..end].trim();
                match variables.get(var) {
                    Some(value) => out.push_str(value),
                    None => {
                        if !missing.contains(&var.to_string()) {
                            missing.push(var.to_string());
                        }
                        out.push_str(&rest[start..start + 2 + end + 2]);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Instantiate a workflow from a template, substituting variables in the
/// workflow name and every task name/description.
pub async fn apply(
    pool: &SqlitePool,
    template_id_or_name: &str,
    workflow_name: &str,
    variables: &HashMap<String, String>,
) -> ToolResult<(Workflow, Vec<caw_db::models::Task>)> {
    let template = match template_db::get_template(pool, template_id_or_name).await? {
        Some(t) => t,
        None => template_db::get_by_name(pool, template_id_or_name)
            .await?
            .ok_or_else(|| {
                ToolError::new(
                    ErrorCode::TemplateNotFound,
                    format!("template {template_id_or_name} not found"),
                )
            })?,
    };

    let declared: Vec<String> =
        serde_json::from_str(&template.variables).map_err(ToolError::internal)?;
    let unbound: Vec<String> = declared
        .iter()
        .filter(|v| !variables.contains_key(*v))
        .cloned()
        .collect();
    if !unbound.is_empty() {
        return Err(ToolError::new(
            ErrorCode::MissingVariables,
            format!("missing template variables: {}", unbound.join(", ")),
        ));
    }

    let tasks: Vec<TemplateTask> =
        serde_json::from_str(&template.tasks).map_err(ToolError::internal)?;

    let mut missing = Vec::new();
    let name = substitute(workflow_name, variables, &mut missing);
    let specs: Vec<TaskSpec> = tasks
        .iter()
        .map(|t| TaskSpec {
            name: substitute(&t.name, variables, &mut missing),
            description: substitute(&t.description, variables, &mut missing),
            parallel_group: t.parallel_group.clone(),
            depends_on: t
                .depends_on
                .iter()
                .map(|d| substitute(d, variables, &mut missing))
                .collect(),
        })
        .collect();

    if !missing.is_empty() {
        return Err(ToolError::new(
            ErrorCode::MissingVariables,
            format!("missing template variables: {}", missing.join(", ")),
        ));
    }

    let created = workflow::create(
        pool,
        &CreateWorkflow {
            name,
            source: WorkflowSource::Custom,
            source_reference: Some(template.name.clone()),
            source_content: None,
            max_parallel_tasks: 1,
            auto_create_workspaces: false,
        },
    )
    .await?;

    let summary = template
        .description
        .clone()
        .unwrap_or_else(|| format!("instantiated from template {}", template.name));
    let tasks = workflow::set_plan(pool, &created.id, &summary, &specs).await?;
    let workflow = crate::services::require_workflow(pool, &created.id).await?;

    Ok((workflow, tasks))
}
