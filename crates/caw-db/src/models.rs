use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Where a workflow came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowSource {
    Prompt,
    GithubIssue,
    Linear,
    Jira,
    Custom,
}

impl fmt::Display for WorkflowSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Prompt => "prompt",
            Self::GithubIssue => "github_issue",
            Self::Linear => "linear",
            Self::Jira => "jira",
            Self::Custom => "custom",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowSource {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prompt" => Ok(Self::Prompt),
            "github_issue" => Ok(Self::GithubIssue),
            "linear" => Ok(Self::Linear),
            "jira" => Ok(Self::Jira),
            "custom" => Ok(Self::Custom),
            other => Err(EnumParseError::new("workflow source", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Planning,
    Ready,
    InProgress,
    Paused,
    Completed,
    AwaitingMerge,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::AwaitingMerge => "awaiting_merge",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkflowStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "awaiting_merge" => Ok(Self::AwaitingMerge),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("workflow status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task within a workflow DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Blocked,
    Planning,
    InProgress,
    Completed,
    Failed,
    Paused,
    Skipped,
}

impl TaskStatus {
    /// `completed` and `skipped` are the only states that satisfy a
    /// dependency edge and never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Planning => "planning",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "blocked" => Ok(Self::Blocked),
            "planning" => Ok(Self::Planning),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            "skipped" => Ok(Self::Skipped),
            other => Err(EnumParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a checkpoint record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    Plan,
    Progress,
    Decision,
    Error,
    Recovery,
    Complete,
    Replan,
}

impl fmt::Display for CheckpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Plan => "plan",
            Self::Progress => "progress",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::Recovery => "recovery",
            Self::Complete => "complete",
            Self::Replan => "replan",
        };
        f.write_str(s)
    }
}

impl FromStr for CheckpointType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "progress" => Ok(Self::Progress),
            "decision" => Ok(Self::Decision),
            "error" => Ok(Self::Error),
            "recovery" => Ok(Self::Recovery),
            "complete" => Ok(Self::Complete),
            "replan" => Ok(Self::Replan),
            other => Err(EnumParseError::new("checkpoint type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of an inter-agent message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    StatusUpdate,
    Query,
    Response,
    Broadcast,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskAssignment => "task_assignment",
            Self::StatusUpdate => "status_update",
            Self::Query => "query",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_assignment" => Ok(Self::TaskAssignment),
            "status_update" => Ok(Self::StatusUpdate),
            "query" => Ok(Self::Query),
            "response" => Ok(Self::Response),
            "broadcast" => Ok(Self::Broadcast),
            other => Err(EnumParseError::new("message type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Priority of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(s)
    }
}

impl FromStr for MessagePriority {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" => Ok(Self::Urgent),
            other => Err(EnumParseError::new("message priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Read/archive status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Read,
    Archived,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unread => "unread",
            Self::Read => "read",
            Self::Archived => "archived",
        };
        f.write_str(s)
    }
}

impl FromStr for MessageStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unread" => Ok(Self::Unread),
            "read" => Ok(Self::Read),
            "archived" => Ok(Self::Archived),
            other => Err(EnumParseError::new("message status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Runtime an agent executes under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRuntime {
    ClaudeCode,
    Codex,
    Opencode,
    Custom,
    Human,
}

impl fmt::Display for AgentRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClaudeCode => "claude_code",
            Self::Codex => "codex",
            Self::Opencode => "opencode",
            Self::Custom => "custom",
            Self::Human => "human",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRuntime {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude_code" => Ok(Self::ClaudeCode),
            "codex" => Ok(Self::Codex),
            "opencode" => Ok(Self::Opencode),
            "custom" => Ok(Self::Custom),
            "human" => Ok(Self::Human),
            other => Err(EnumParseError::new("agent runtime", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Role of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Coordinator,
    Worker,
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coordinator => "coordinator",
            Self::Worker => "worker",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentRole {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Self::Coordinator),
            "worker" => Ok(Self::Worker),
            other => Err(EnumParseError::new("agent role", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
    Busy,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "busy" => Ok(Self::Busy),
            other => Err(EnumParseError::new("agent status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle status of a workspace (git worktree).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Merged,
    Abandoned,
}

impl fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Merged => "merged",
            Self::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkspaceStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "merged" => Ok(Self::Merged),
            "abandoned" => Ok(Self::Abandoned),
            other => Err(EnumParseError::new("workspace status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A workflow -- the top-level unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub source: WorkflowSource,
    pub source_reference: Option<String>,
    pub source_content: Option<String>,
    pub status: WorkflowStatus,
    pub plan_summary: Option<String>,
    /// Free-form JSON blob; the spawner persists its own metadata here.
    pub config: Option<String>,
    pub max_parallel_tasks: i64,
    pub auto_create_workspaces: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A task -- one node of a workflow's DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub workflow_id: String,
    pub name: String,
    pub description: String,
    pub status: TaskStatus,
    /// 1..N within the workflow, gap-free.
    pub sequence: i64,
    pub parallel_group: Option<String>,
    pub plan: Option<String>,
    pub context: Option<String>,
    pub outcome: Option<String>,
    pub error: Option<String>,
    pub workspace_id: Option<String>,
    pub repository_id: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub claimed_at: Option<i64>,
    pub context_from: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// An edge in the task dependency DAG.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: String,
    pub depends_on: String,
}

/// An append-only per-task progress record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// 1..K within the task, strictly increasing.
    pub sequence: i64,
    pub checkpoint_type: CheckpointType,
    pub summary: String,
    pub detail: Option<String>,
    /// JSON array of file paths.
    pub files: Option<String>,
    pub created_at: i64,
}

/// A durable inter-agent or agent-operator message.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: String,
    pub message_type: MessageType,
    pub subject: String,
    pub body: String,
    pub priority: MessagePriority,
    pub status: MessageStatus,
    pub workflow_id: Option<String>,
    pub task_id: Option<String>,
    pub reply_to_id: Option<String>,
    pub created_at: i64,
}

/// A live or recently-live execution principal.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub runtime: AgentRuntime,
    pub role: AgentRole,
    pub status: AgentStatus,
    /// JSON array of capability strings.
    pub capabilities: Option<String>,
    pub workflow_id: Option<String>,
    pub workspace_path: Option<String>,
    pub current_task_id: Option<String>,
    pub last_heartbeat: i64,
    /// Free-form JSON blob.
    pub metadata: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named git worktree bound to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workspace {
    pub id: String,
    pub workflow_id: String,
    pub path: String,
    pub branch: String,
    pub base_branch: String,
    pub pr_url: Option<String>,
    pub status: WorkspaceStatus,
    pub merge_commit: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Canonical record for a filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Repository {
    pub id: String,
    pub path: String,
    pub name: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A reusable serialized plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// JSON array of task specs.
    pub tasks: String,
    /// JSON array of variable names.
    pub variables: String,
    pub created_at: i64,
}

/// A client process identity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Session {
    pub id: String,
    pub pid: i64,
    pub is_daemon: bool,
    pub last_heartbeat: i64,
    pub created_at: i64,
}

/// The exclusive-writer lock row for a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowLock {
    pub workflow_id: String,
    pub session_id: String,
    pub locked_at: i64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(variants: &[T])
    where
        T: fmt::Display + FromStr<Err = EnumParseError> + PartialEq + fmt::Debug + Copy,
    {
        for v in variants {
            let s = v.to_string();
            let parsed: T = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn workflow_status_display_roundtrip() {
        roundtrip(&[
            WorkflowStatus::Planning,
            WorkflowStatus::Ready,
            WorkflowStatus::InProgress,
            WorkflowStatus::Paused,
            WorkflowStatus::Completed,
            WorkflowStatus::AwaitingMerge,
            WorkflowStatus::Failed,
            WorkflowStatus::Cancelled,
        ]);
    }

    #[test]
    fn task_status_display_roundtrip() {
        roundtrip(&[
            TaskStatus::Pending,
            TaskStatus::Blocked,
            TaskStatus::Planning,
            TaskStatus::InProgress,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Paused,
            TaskStatus::Skipped,
        ]);
    }

    #[test]
    fn checkpoint_type_display_roundtrip() {
        roundtrip(&[
            CheckpointType::Plan,
            CheckpointType::Progress,
            CheckpointType::Decision,
            CheckpointType::Error,
            CheckpointType::Recovery,
            CheckpointType::Complete,
            CheckpointType::Replan,
        ]);
    }

    #[test]
    fn message_enums_display_roundtrip() {
        roundtrip(&[
            MessageType::TaskAssignment,
            MessageType::StatusUpdate,
            MessageType::Query,
            MessageType::Response,
            MessageType::Broadcast,
        ]);
        roundtrip(&[
            MessagePriority::Low,
            MessagePriority::Normal,
            MessagePriority::High,
            MessagePriority::Urgent,
        ]);
        roundtrip(&[MessageStatus::Unread, MessageStatus::Read, MessageStatus::Archived]);
    }

    #[test]
    fn agent_enums_display_roundtrip() {
        roundtrip(&[
            AgentRuntime::ClaudeCode,
            AgentRuntime::Codex,
            AgentRuntime::Opencode,
            AgentRuntime::Custom,
            AgentRuntime::Human,
        ]);
        roundtrip(&[AgentRole::Coordinator, AgentRole::Worker]);
        roundtrip(&[AgentStatus::Online, AgentStatus::Offline, AgentStatus::Busy]);
    }

    #[test]
    fn workspace_and_source_display_roundtrip() {
        roundtrip(&[
            WorkspaceStatus::Active,
            WorkspaceStatus::Merged,
            WorkspaceStatus::Abandoned,
        ]);
        roundtrip(&[
            WorkflowSource::Prompt,
            WorkflowSource::GithubIssue,
            WorkflowSource::Linear,
            WorkflowSource::Jira,
            WorkflowSource::Custom,
        ]);
    }

    #[test]
    fn invalid_enum_strings_rejected() {
        assert!("bogus".parse::<WorkflowStatus>().is_err());
        assert!("nope".parse::<TaskStatus>().is_err());
        assert!("warmup".parse::<CheckpointType>().is_err());
        assert!("email".parse::<MessageType>().is_err());
        assert!("robot".parse::<AgentRuntime>().is_err());
        assert!("closed".parse::<WorkspaceStatus>().is_err());
    }

    #[test]
    fn task_terminality() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Skipped.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }

    #[test]
    fn workflow_terminality() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::AwaitingMerge.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }
}
