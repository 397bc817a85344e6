//! Linear schema migrations.
//!
//! Each entry in [`MIGRATIONS`] is a SQL script. The runner in
//! [`crate::pool::run_migrations`] applies every script past the current
//! `schema_version` row inside its own transaction, then bumps the version.
//! Scripts are append-only; never edit an entry that has shipped.

/// Migration 1: full initial schema.
const M0001_INITIAL: &str = r#"
CREATE TABLE workflows (
    id                      TEXT PRIMARY KEY,
    name                    TEXT NOT NULL,
    source                  TEXT NOT NULL DEFAULT 'prompt',
    source_reference        TEXT,
    source_content          TEXT,
    status                  TEXT NOT NULL DEFAULT 'planning',
    plan_summary            TEXT,
    config                  TEXT,
    max_parallel_tasks      INTEGER NOT NULL DEFAULT 1,
    auto_create_workspaces  INTEGER NOT NULL DEFAULT 0,
    created_at              INTEGER NOT NULL,
    updated_at              INTEGER NOT NULL
);

CREATE TABLE tasks (
    id                 TEXT PRIMARY KEY,
    workflow_id        TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    name               TEXT NOT NULL,
    description        TEXT NOT NULL DEFAULT '',
    status             TEXT NOT NULL DEFAULT 'pending',
    sequence           INTEGER NOT NULL,
    parallel_group     TEXT,
    plan               TEXT,
    context            TEXT,
    outcome            TEXT,
    error              TEXT,
    workspace_id       TEXT,
    repository_id      TEXT,
    assigned_agent_id  TEXT,
    claimed_at         INTEGER,
    context_from       TEXT,
    created_at         INTEGER NOT NULL,
    updated_at         INTEGER NOT NULL,
    UNIQUE (workflow_id, name)
);

CREATE TABLE task_dependencies (
    task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    depends_on  TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    PRIMARY KEY (task_id, depends_on)
);

CREATE TABLE checkpoints (
    id               TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    sequence         INTEGER NOT NULL,
    checkpoint_type  TEXT NOT NULL,
    summary          TEXT NOT NULL,
    detail           TEXT,
    files            TEXT,
    created_at       INTEGER NOT NULL,
    UNIQUE (task_id, sequence)
);

CREATE TABLE messages (
    id            TEXT PRIMARY KEY,
    sender_id     TEXT NOT NULL,
    recipient_id  TEXT NOT NULL,
    message_type  TEXT NOT NULL,
    subject       TEXT NOT NULL DEFAULT '',
    body          TEXT NOT NULL,
    priority      TEXT NOT NULL DEFAULT 'normal',
    status        TEXT NOT NULL DEFAULT 'unread',
    workflow_id   TEXT,
    task_id       TEXT,
    reply_to_id   TEXT,
    created_at    INTEGER NOT NULL
);

CREATE TABLE agents (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    runtime          TEXT NOT NULL DEFAULT 'claude_code',
    role             TEXT NOT NULL DEFAULT 'worker',
    status           TEXT NOT NULL DEFAULT 'online',
    capabilities     TEXT,
    workflow_id      TEXT,
    workspace_path   TEXT,
    current_task_id  TEXT,
    last_heartbeat   INTEGER NOT NULL,
    metadata         TEXT,
    created_at       INTEGER NOT NULL,
    updated_at       INTEGER NOT NULL
);

CREATE TABLE workspaces (
    id            TEXT PRIMARY KEY,
    workflow_id   TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    path          TEXT NOT NULL,
    branch        TEXT NOT NULL,
    base_branch   TEXT NOT NULL DEFAULT 'main',
    pr_url        TEXT,
    status        TEXT NOT NULL DEFAULT 'active',
    merge_commit  TEXT,
    created_at    INTEGER NOT NULL,
    updated_at    INTEGER NOT NULL
);

CREATE TABLE repositories (
    id          TEXT PRIMARY KEY,
    path        TEXT NOT NULL UNIQUE,
    name        TEXT,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL
);

CREATE TABLE workflow_repositories (
    workflow_id    TEXT NOT NULL REFERENCES workflows(id) ON DELETE CASCADE,
    repository_id  TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
    PRIMARY KEY (workflow_id, repository_id)
);

CREATE TABLE templates (
    id           TEXT PRIMARY KEY,
    name         TEXT NOT NULL UNIQUE,
    description  TEXT,
    tasks        TEXT NOT NULL,
    variables    TEXT NOT NULL DEFAULT '[]',
    created_at   INTEGER NOT NULL
);

CREATE TABLE sessions (
    id              TEXT PRIMARY KEY,
    pid             INTEGER NOT NULL,
    is_daemon       INTEGER NOT NULL DEFAULT 0,
    last_heartbeat  INTEGER NOT NULL,
    created_at      INTEGER NOT NULL
);

CREATE TABLE workflow_locks (
    workflow_id  TEXT PRIMARY KEY REFERENCES workflows(id) ON DELETE CASCADE,
    session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    locked_at    INTEGER NOT NULL
);
"#;

/// Migration 2: hot-path indexes.
const M0002_INDEXES: &str = r#"
CREATE INDEX idx_tasks_workflow ON tasks(workflow_id);
CREATE INDEX idx_tasks_status ON tasks(workflow_id, status);
CREATE INDEX idx_checkpoints_task ON checkpoints(task_id, sequence);
CREATE INDEX idx_messages_recipient ON messages(recipient_id, status);
CREATE INDEX idx_messages_task ON messages(task_id);
CREATE INDEX idx_agents_workflow ON agents(workflow_id);
CREATE INDEX idx_workspaces_workflow ON workspaces(workflow_id);
"#;

/// All migrations, in application order. `schema_version` stores how many
/// have been applied.
pub const MIGRATIONS: &[&str] = &[M0001_INITIAL, M0002_INDEXES];
