//! Child agent launcher.
//!
//! The production launcher spawns the agent binary (`claude` by default)
//! in stream-json mode and parses its line-delimited stdout into
//! [`AgentStreamEvent`] values. The trait is the seam the tests use to
//! inject a mock child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::Stream;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How much latitude the child gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    /// `--dangerously-skip-permissions`
    BypassPermissions,
    /// `--allowedTools mcp__caw__*`
    CawToolsOnly,
}

/// Everything needed to launch one agent process.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub workflow_id: String,
    pub task_id: String,
    pub agent_id: String,
    /// The `-p` prompt (initial task prompt, or continuation on resume).
    pub prompt: String,
    /// `--append-system-prompt`; only set on first spawn.
    pub system_prompt: Option<String>,
    /// `--resume <session_id>` to continue a prior LLM context.
    pub resume_session_id: Option<String>,
    pub model: String,
    pub max_turns: u32,
    pub max_budget_usd: Option<f64>,
    /// `--worktree <slug>` for ephemeral worktrees...
    pub worktree_slug: Option<String>,
    /// ...or a workspace path used as the working directory.
    pub working_dir: Option<PathBuf>,
    /// Port of this daemon's HTTP transport, for the MCP config file.
    pub mcp_port: u16,
    pub permission_mode: PermissionMode,
}

/// One parsed line of the child's stream-json output.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentStreamEvent {
    /// `{type:"system", subtype:"init", session_id}`
    Init { session_id: String },
    /// `{type:"assistant", ...}` -- the text content, flattened.
    Assistant { content: String },
    /// `{type:"result", subtype, errors?}`
    Result { success: bool, errors: Vec<String> },
    /// The process closed stdout; `clean` is the exit-status success.
    Exited { clean: bool, stderr: String },
}

/// Handle to a spawned agent process.
#[derive(Debug)]
pub struct AgentHandle {
    pub pid: u32,
    pub task_id: String,
    pub agent_id: String,
    /// LLM session id captured from the init event, for later resume.
    pub session_id: Arc<StdMutex<Option<String>>>,
}

/// Seam between the pool and the child process.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    /// Launch an agent for the given spec.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle>;

    /// Stream the agent's parsed stdout. Consumable once per handle; the
    /// final item is always [`AgentStreamEvent::Exited`].
    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentStreamEvent> + Send>>;

    /// Terminate the agent (SIGTERM, then SIGKILL after a grace period).
    async fn kill(&self, handle: &AgentHandle) -> Result<()>;

    /// Whether the process is still alive.
    async fn is_running(&self, handle: &AgentHandle) -> bool;
}

// ---------------------------------------------------------------------------
// stream-json parsing
// ---------------------------------------------------------------------------

/// Parse one JSONL line from the child's stdout.
///
/// Returns `Ok(None)` for recognised-but-irrelevant records; `Err` means
/// the line was not valid JSON and the caller should log and continue.
pub fn parse_stream_line(line: &str) -> Result<Option<AgentStreamEvent>> {
    let v: serde_json::Value =
        serde_json::from_str(line).context("malformed JSON in agent stream output")?;

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");

    match event_type {
        "system" => {
            let subtype = v.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
            if subtype == "init" {
                if let Some(session_id) = v.get("session_id").and_then(|s| s.as_str()) {
                    return Ok(Some(AgentStreamEvent::Init {
                        session_id: session_id.to_string(),
                    }));
                }
            }
            Ok(None)
        }
        "assistant" => {
            // Flatten the text blocks of the message; tool_use blocks are
            // tracked only as turn activity.
            let mut content = String::new();
            if let Some(blocks) = v
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in blocks {
                    if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                        if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                            if !content.is_empty() {
                                content.push('\n');
                            }
                            content.push_str(text);
                        }
                    }
                }
            }
            Ok(Some(AgentStreamEvent::Assistant { content }))
        }
        "result" => {
            let subtype = v.get("subtype").and_then(|s| s.as_str()).unwrap_or("");
            let errors = v
                .get("errors")
                .and_then(|e| e.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|e| e.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(AgentStreamEvent::Result {
                success: subtype == "success",
                errors,
            }))
        }
        other => {
            debug!(event_type = other, "ignoring unrecognised stream-json record");
            Ok(None)
        }
    }
}

// ---------------------------------------------------------------------------
// Production launcher
// ---------------------------------------------------------------------------

/// Internal state kept per spawned process.
struct ProcessState {
    child: Child,
    /// `Option` so the events stream can `.take()` it exactly once.
    stdout: Option<ChildStdout>,
    /// Captured stderr, filled by a background reader.
    stderr: Arc<StdMutex<String>>,
    /// MCP config temp file; removed when the process is reaped.
    mcp_config_path: Option<PathBuf>,
}

/// Launcher that spawns the real agent binary.
#[derive(Clone)]
pub struct ClaudeCodeLauncher {
    binary_path: String,
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ClaudeCodeLauncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaudeCodeLauncher")
            .field("binary_path", &self.binary_path)
            .finish()
    }
}

impl ClaudeCodeLauncher {
    /// Look for the agent binary on `$PATH`.
    pub fn new() -> Self {
        Self::with_binary("claude")
    }

    /// Use a custom binary path (tests point this at shell scripts).
    pub fn with_binary(path: impl Into<String>) -> Self {
        Self {
            binary_path: path.into(),
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Write the MCP client config the child connects back through.
    fn write_mcp_config(port: u16) -> Result<PathBuf> {
        let config = serde_json::json!({
            "mcpServers": {
                "caw": {
                    "type": "sse",
                    "url": format!("http://localhost:{port}/mcp"),
                }
            }
        });
        let mut file = tempfile::Builder::new()
            .prefix("caw-mcp-")
            .suffix(".json")
            .tempfile()
            .context("failed to create mcp config temp file")?;
        use std::io::Write;
        file.write_all(config.to_string().as_bytes())
            .context("failed to write mcp config")?;
        let (_, path) = file.keep().context("failed to persist mcp config")?;
        Ok(path)
    }
}

impl Default for ClaudeCodeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentLauncher for ClaudeCodeLauncher {
    async fn spawn(&self, spec: &SpawnSpec) -> Result<AgentHandle> {
        let mcp_config_path = Self::write_mcp_config(spec.mcp_port)?;

        let mut cmd = Command::new(&self.binary_path);

        match &spec.resume_session_id {
            Some(session_id) => {
                cmd.arg("--resume").arg(session_id).arg("-p").arg(&spec.prompt);
            }
            None => {
                cmd.arg("-p").arg(&spec.prompt);
                if let Some(system_prompt) = &spec.system_prompt {
                    cmd.arg("--append-system-prompt").arg(system_prompt);
                }
            }
        }

        cmd.arg("--mcp-config")
            .arg(&mcp_config_path)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--no-session-persistence")
            .arg("--model")
            .arg(&spec.model)
            .arg("--max-turns")
            .arg(spec.max_turns.to_string());

        if let Some(budget) = spec.max_budget_usd {
            cmd.arg("--max-budget-usd").arg(budget.to_string());
        }

        if let Some(slug) = &spec.worktree_slug {
            cmd.arg("--worktree").arg(slug);
        } else if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        match spec.permission_mode {
            PermissionMode::BypassPermissions => {
                cmd.arg("--dangerously-skip-permissions");
            }
            PermissionMode::CawToolsOnly => {
                cmd.arg("--allowedTools").arg("mcp__caw__*");
            }
        }

        // Scrub nesting-detection variables so the child does not think it
        // is running inside another agent.
        cmd.env_remove("CLAUDECODE");
        cmd.env_remove("CLAUDE_CODE_ENTRYPOINT");
        cmd.env_remove("CLAUDE_CODE_SSE_PORT");

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent binary at '{}' -- is it installed and on PATH?",
                self.binary_path
            )
        })?;

        let pid = child.id().context("child process has no pid")?;
        let stdout = child.stdout.take();
        let stderr_buf = Arc::new(StdMutex::new(String::new()));

        // Drain stderr in the background so the pipe never fills up.
        if let Some(stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut guard = buf.lock().unwrap_or_else(|e| e.into_inner());
                    guard.push_str(&line);
                    guard.push('\n');
                }
            });
        }

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ProcessState {
                    child,
                    stdout,
                    stderr: stderr_buf,
                    mcp_config_path: Some(mcp_config_path),
                },
            );
        }

        Ok(AgentHandle {
            pid,
            task_id: spec.task_id.clone(),
            agent_id: spec.agent_id.clone(),
            session_id: Arc::new(StdMutex::new(spec.resume_session_id.clone())),
        })
    }

    fn events(&self, handle: &AgentHandle) -> Pin<Box<dyn Stream<Item = AgentStreamEvent> + Send>> {
        let pid = handle.pid;
        let processes = Arc::clone(&self.processes);
        let session_slot = Arc::clone(&handle.session_id);

        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "no stdout available -- events already consumed or process missing");
                yield AgentStreamEvent::Exited { clean: false, stderr: String::new() };
                return;
            };

            let reader = BufReader::new(stdout);
            let mut lines = reader.lines();

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match parse_stream_line(trimmed) {
                            Ok(Some(event)) => {
                                if let AgentStreamEvent::Init { session_id } = &event {
                                    *session_slot.lock().unwrap_or_else(|e| e.into_inner()) =
                                        Some(session_id.clone());
                                }
                                yield event;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(line = trimmed, error = %e, "skipping malformed JSONL line");
                            }
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        warn!(error = %e, "error reading agent stdout");
                        break;
                    }
                }
            }

            // Reap the process to learn the exit status and collect stderr.
            let (clean, stderr) = {
                let mut procs = processes.lock().await;
                match procs.remove(&pid) {
                    Some(mut state) => {
                        let status = state.child.wait().await;
                        let clean = status.map(|s| s.success()).unwrap_or(false);
                        let stderr = state
                            .stderr
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .clone();
                        if let Some(path) = state.mcp_config_path.take() {
                            let _ = std::fs::remove_file(path);
                        }
                        (clean, stderr)
                    }
                    None => (false, String::new()),
                }
            };

            yield AgentStreamEvent::Exited { clean, stderr };
        };

        Box::pin(stream)
    }

    async fn kill(&self, handle: &AgentHandle) -> Result<()> {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            // SIGTERM first so the child can flush; SIGKILL if it lingers.
            #[cfg(unix)]
            {
                // SAFETY: pid came from a child we spawned.
                let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if ret != 0 {
                    warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
                }
            }

            let exited =
                tokio::time::timeout(std::time::Duration::from_secs(5), state.child.wait()).await;

            match exited {
                Ok(Ok(_status)) => {
                    debug!(pid, "process exited after SIGTERM");
                }
                _ => {
                    debug!(pid, "process did not exit after SIGTERM, sending SIGKILL");
                    let _ = state.child.kill().await;
                }
            }

            if let Some(path) = state.mcp_config_path.take() {
                let _ = std::fs::remove_file(path);
            }
            processes.remove(&pid);
        } else {
            debug!(pid, "kill called but process not in map (already exited?)");
        }

        Ok(())
    }

    async fn is_running(&self, handle: &AgentHandle) -> bool {
        let pid = handle.pid;
        let mut processes = self.processes.lock().await;

        if let Some(state) = processes.get_mut(&pid) {
            match state.child.try_wait() {
                Ok(Some(_status)) => {
                    processes.remove(&pid);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking process status");
                    false
                }
            }
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn test_spec() -> SpawnSpec {
        SpawnSpec {
            workflow_id: "wf_test".into(),
            task_id: "tk_test".into(),
            agent_id: "ag_test".into(),
            prompt: "do the task".into(),
            system_prompt: Some("you are a worker".into()),
            resume_session_id: None,
            model: "sonnet".into(),
            max_turns: 10,
            max_budget_usd: None,
            worktree_slug: None,
            working_dir: None,
            mcp_port: 3100,
            permission_mode: PermissionMode::CawToolsOnly,
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    // -- parsing -----------------------------------------------------------

    #[test]
    fn parse_init_record() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-42"}"#;
        let event = parse_stream_line(line).unwrap();
        assert_eq!(
            event,
            Some(AgentStreamEvent::Init {
                session_id: "sess-42".to_string()
            })
        );
    }

    #[test]
    fn parse_non_init_system_record_is_ignored() {
        let line = r#"{"type":"system","subtype":"warmup"}"#;
        assert_eq!(parse_stream_line(line).unwrap(), None);
    }

    #[test]
    fn parse_assistant_text_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"working"},{"type":"tool_use","name":"Bash"},{"type":"text","text":"done"}]}}"#;
        let event = parse_stream_line(line).unwrap();
        assert_eq!(
            event,
            Some(AgentStreamEvent::Assistant {
                content: "working\ndone".to_string()
            })
        );
    }

    #[test]
    fn parse_result_success() {
        let line = r#"{"type":"result","subtype":"success"}"#;
        let event = parse_stream_line(line).unwrap();
        assert_eq!(
            event,
            Some(AgentStreamEvent::Result {
                success: true,
                errors: vec![]
            })
        );
    }

    #[test]
    fn parse_result_error_with_messages() {
        let line = r#"{"type":"result","subtype":"error_max_turns","errors":["ran out of turns"]}"#;
        let event = parse_stream_line(line).unwrap();
        assert_eq!(
            event,
            Some(AgentStreamEvent::Result {
                success: false,
                errors: vec!["ran out of turns".to_string()]
            })
        );
    }

    #[test]
    fn parse_unknown_type_ignored() {
        let line = r#"{"type":"user","message":"hi"}"#;
        assert_eq!(parse_stream_line(line).unwrap(), None);
    }

    #[test]
    fn parse_malformed_json_is_an_error() {
        assert!(parse_stream_line("this is not json").is_err());
    }

    // -- subprocess integration --------------------------------------------

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_streams_events_and_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "fake_agent.sh",
            "echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}'\n\
             echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"hello\"}]}}'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n",
        );

        let launcher = ClaudeCodeLauncher::with_binary(script.to_str().unwrap());
        let handle = launcher.spawn(&test_spec()).await.unwrap();
        assert!(handle.pid > 0);

        let events: Vec<AgentStreamEvent> = launcher.events(&handle).collect().await;
        assert_eq!(
            events[0],
            AgentStreamEvent::Init {
                session_id: "s1".to_string()
            }
        );
        assert!(matches!(events.last().unwrap(), AgentStreamEvent::Exited { clean: true, .. }));
        assert!(events.iter().any(|e| matches!(e, AgentStreamEvent::Result { success: true, .. })));

        // Session id was captured for resume.
        assert_eq!(
            handle.session_id.lock().unwrap().as_deref(),
            Some("s1")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(
            tmp.path(),
            "bad_agent.sh",
            "echo 'garbage'\n\
             echo '{\"type\":\"result\",\"subtype\":\"success\"}'\n",
        );

        let launcher = ClaudeCodeLauncher::with_binary(script.to_str().unwrap());
        let handle = launcher.spawn(&test_spec()).await.unwrap();
        let events: Vec<AgentStreamEvent> = launcher.events(&handle).collect().await;

        assert!(events.iter().any(|e| matches!(e, AgentStreamEvent::Result { success: true, .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_reports_unclean_with_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "dying_agent.sh", "echo boom >&2\nexit 3\n");

        let launcher = ClaudeCodeLauncher::with_binary(script.to_str().unwrap());
        let handle = launcher.spawn(&test_spec()).await.unwrap();
        let events: Vec<AgentStreamEvent> = launcher.events(&handle).collect().await;

        match events.last().unwrap() {
            AgentStreamEvent::Exited { clean, stderr } => {
                assert!(!clean);
                assert!(stderr.contains("boom"));
            }
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_terminates_subprocess() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "sleepy_agent.sh", "sleep 3600\n");

        let launcher = ClaudeCodeLauncher::with_binary(script.to_str().unwrap());
        let handle = launcher.spawn(&test_spec()).await.unwrap();
        assert!(launcher.is_running(&handle).await);

        launcher.kill(&handle).await.unwrap();
        assert!(!launcher.is_running(&handle).await);
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let launcher = ClaudeCodeLauncher::with_binary("/nonexistent/agent");
        let result = launcher.spawn(&test_spec()).await;
        assert!(result.is_err());
        let message = format!("{:#}", result.unwrap_err());
        assert!(message.contains("failed to spawn agent binary"));
    }
}
