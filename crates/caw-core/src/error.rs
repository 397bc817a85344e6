//! The structured tool-error taxonomy.
//!
//! Every error that crosses the RPC boundary is a [`ToolError`] with a
//! fixed shape: `{code, message, recoverable, suggestion}`. The code set is
//! closed; `recoverable` and `suggestion` are properties of the code, not
//! of the call site. `INTERNAL_ERROR` is the only default mapping -- every
//! other code is emitted only when its exact condition matched.

use serde::Serialize;
use thiserror::Error;

/// Closed set of tool error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorCode {
    WorkflowNotFound,
    TaskNotFound,
    AgentNotFound,
    MessageNotFound,
    RecipientNotFound,
    SenderNotFound,
    WorkspaceNotFound,
    RepositoryNotFound,
    TemplateNotFound,
    SessionNotFound,
    RepositoryInUse,
    WorkflowLocked,
    WorkflowMismatch,
    InvalidTransition,
    InvalidState,
    InvalidInput,
    TaskBlocked,
    MissingOutcome,
    MissingError,
    MissingMergeCommit,
    MissingRepoPath,
    MissingPath,
    MissingVariables,
    DuplicateTaskName,
    DuplicateTemplate,
    SelfDependency,
    UnknownDependency,
    TaskNotRemovable,
    NameConflict,
    NotClaimed,
    NotAssigned,
    AlreadyRunning,
    NotRunning,
    NotSuspended,
    SpawnerError,
    InternalError,
}

impl ErrorCode {
    /// The wire name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            Self::TaskNotFound => "TASK_NOT_FOUND",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::MessageNotFound => "MESSAGE_NOT_FOUND",
            Self::RecipientNotFound => "RECIPIENT_NOT_FOUND",
            Self::SenderNotFound => "SENDER_NOT_FOUND",
            Self::WorkspaceNotFound => "WORKSPACE_NOT_FOUND",
            Self::RepositoryNotFound => "REPOSITORY_NOT_FOUND",
            Self::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::RepositoryInUse => "REPOSITORY_IN_USE",
            Self::WorkflowLocked => "WORKFLOW_LOCKED",
            Self::WorkflowMismatch => "WORKFLOW_MISMATCH",
            Self::InvalidTransition => "INVALID_TRANSITION",
            Self::InvalidState => "INVALID_STATE",
            Self::InvalidInput => "INVALID_INPUT",
            Self::TaskBlocked => "TASK_BLOCKED",
            Self::MissingOutcome => "MISSING_OUTCOME",
            Self::MissingError => "MISSING_ERROR",
            Self::MissingMergeCommit => "MISSING_MERGE_COMMIT",
            Self::MissingRepoPath => "MISSING_REPO_PATH",
            Self::MissingPath => "MISSING_PATH",
            Self::MissingVariables => "MISSING_VARIABLES",
            Self::DuplicateTaskName => "DUPLICATE_TASK_NAME",
            Self::DuplicateTemplate => "DUPLICATE_TEMPLATE",
            Self::SelfDependency => "SELF_DEPENDENCY",
            Self::UnknownDependency => "UNKNOWN_DEPENDENCY",
            Self::TaskNotRemovable => "TASK_NOT_REMOVABLE",
            Self::NameConflict => "NAME_CONFLICT",
            Self::NotClaimed => "NOT_CLAIMED",
            Self::NotAssigned => "NOT_ASSIGNED",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::NotRunning => "NOT_RUNNING",
            Self::NotSuspended => "NOT_SUSPENDED",
            Self::SpawnerError => "SPAWNER_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Whether the caller can retry after correcting its inputs.
    pub fn recoverable(self) -> bool {
        match self {
            // Wrong or stale identifiers and malformed inputs: fix and retry.
            Self::WorkflowNotFound
            | Self::TaskNotFound
            | Self::AgentNotFound
            | Self::MessageNotFound
            | Self::RecipientNotFound
            | Self::SenderNotFound
            | Self::WorkspaceNotFound
            | Self::RepositoryNotFound
            | Self::TemplateNotFound
            | Self::SessionNotFound
            | Self::InvalidInput
            | Self::TaskBlocked
            | Self::MissingOutcome
            | Self::MissingError
            | Self::MissingMergeCommit
            | Self::MissingRepoPath
            | Self::MissingPath
            | Self::MissingVariables
            | Self::DuplicateTaskName
            | Self::DuplicateTemplate
            | Self::SelfDependency
            | Self::UnknownDependency
            | Self::NameConflict
            | Self::NotClaimed
            | Self::NotAssigned
            | Self::WorkflowMismatch
            | Self::WorkflowLocked => true,
            // State-machine and infrastructure failures: retrying the same
            // call cannot help.
            Self::RepositoryInUse
            | Self::InvalidTransition
            | Self::InvalidState
            | Self::TaskNotRemovable
            | Self::AlreadyRunning
            | Self::NotRunning
            | Self::NotSuspended
            | Self::SpawnerError
            | Self::InternalError => false,
        }
    }

    /// Fixed guidance string attached to every error with this code.
    pub fn suggestion(self) -> &'static str {
        match self {
            Self::WorkflowNotFound => "Verify the workflow id with workflow_list.",
            Self::TaskNotFound => "Verify the task id with workflow_get(include_tasks=true).",
            Self::AgentNotFound => "Verify the agent id with agent_list.",
            Self::MessageNotFound => "Verify the message id with message_list.",
            Self::RecipientNotFound => "The recipient must be a registered agent id.",
            Self::SenderNotFound => "The sender must be a registered agent id.",
            Self::WorkspaceNotFound => "Verify the workspace id with workspace_list.",
            Self::RepositoryNotFound => "Register the repository first with repository_register.",
            Self::TemplateNotFound => "Verify the template id or name with template_list.",
            Self::SessionNotFound => "Register a session before locking workflows.",
            Self::RepositoryInUse => "Remove the repository from all workflows first.",
            Self::WorkflowLocked => "Another session holds the write lock; retry later or omit session_id for read-only use.",
            Self::WorkflowMismatch => "The referenced entities belong to different workflows.",
            Self::InvalidTransition => "Check the current status before requesting a transition.",
            Self::InvalidState => "The operation is not valid in the entity's current state.",
            Self::InvalidInput => "Check the input fields against the tool schema.",
            Self::TaskBlocked => "Complete or skip the task's dependencies first.",
            Self::MissingOutcome => "Provide a non-empty outcome when completing a task.",
            Self::MissingError => "Provide a non-empty error when failing a task.",
            Self::MissingMergeCommit => "Provide merge_commit when marking a workspace merged.",
            Self::MissingRepoPath => "Provide the repository path.",
            Self::MissingPath => "Provide a filesystem path.",
            Self::MissingVariables => "Provide values for every template variable.",
            Self::DuplicateTaskName => "Task names must be unique within a workflow.",
            Self::DuplicateTemplate => "Template names must be unique; pick another name.",
            Self::SelfDependency => "A task cannot depend on itself.",
            Self::UnknownDependency => "Dependencies must name tasks in the same plan.",
            Self::TaskNotRemovable => "Only pending, blocked, or unassigned planning tasks can be removed.",
            Self::NameConflict => "A new task name collides with a preserved task.",
            Self::NotClaimed => "The task has no claim to release.",
            Self::NotAssigned => "The task is claimed by a different agent.",
            Self::AlreadyRunning => "A spawner for this workflow is already active.",
            Self::NotRunning => "Start the workflow before using execution operations.",
            Self::NotSuspended => "Only a paused workflow can be resumed.",
            Self::SpawnerError => "Inspect the daemon log for the spawner failure.",
            Self::InternalError => "Unexpected failure; inspect the daemon log.",
        }
    }
}

/// A structured error returned verbatim across the RPC boundary.
#[derive(Debug, Clone, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Wrap any non-taxonomy failure.
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::InternalError, format!("{err:#}"))
    }

    /// The wire shape of the error.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code.as_str(),
            "message": self.message,
            "recoverable": self.code.recoverable(),
            "suggestion": self.code.suggestion(),
        })
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        // A ToolError that bubbled through an anyhow layer keeps its code.
        match err.downcast::<ToolError>() {
            Ok(tool_err) => tool_err,
            Err(other) => Self::internal(other),
        }
    }
}

/// Shorthand used throughout the service layer.
pub type ToolResult<T> = Result<T, ToolError>;
