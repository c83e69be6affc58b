//! Session keys, configuration and the values exchanged with backends.
//!
//! A [`SessionKey`] names the logical owner of a sandbox (a workflow run or a
//! single agent run). Two lookups with equal keys always resolve to the same
//! live [`CodeSession`], which is what lets files survive across tool calls.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::limits::ResourceLimits;

/// Name used when a caller does not ask for a specific session.
pub const DEFAULT_SESSION_NAME: &str = "default";

/// Working directory inside a sandbox unless configured otherwise.
pub const DEFAULT_WORKDIR: &str = "/work";

/// The lifetime boundary a session is shared across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Shared by every agent step of one workflow run.
    Workflow,
    /// Private to a single agent run.
    Agent,
}

impl Scope {
    /// Lowercase label used in rendered keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Workflow => "workflow",
            Scope::Agent => "agent",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry key of a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Lifetime boundary.
    pub scope: Scope,
    /// Workflow run id or agent run id, depending on `scope`.
    pub scope_id: String,
    /// Session name within the scope, [`DEFAULT_SESSION_NAME`] unless overridden.
    pub name: String,
}

impl SessionKey {
    /// Key for the default session of a workflow run.
    pub fn workflow(run_id: impl Into<String>) -> Self {
        Self::named(Scope::Workflow, run_id, DEFAULT_SESSION_NAME)
    }

    /// Key for the default session of an agent run.
    pub fn agent(run_id: impl Into<String>) -> Self {
        Self::named(Scope::Agent, run_id, DEFAULT_SESSION_NAME)
    }

    /// Key with an explicit session name.
    pub fn named(scope: Scope, scope_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            scope,
            scope_id: scope_id.into(),
            name: name.into(),
        }
    }

    /// Whether this key belongs to the given scope and scope id, whatever its name.
    pub fn is_in_scope(&self, scope: Scope, scope_id: &str) -> bool {
        self.scope == scope && self.scope_id == scope_id
    }

    /// Common prefix of the rendered keys of every session in a scope.
    pub fn scope_prefix(scope: Scope, scope_id: &str) -> String {
        format!("{scope}:{}:", escape_component(scope_id))
    }

    /// Parse a rendered key back. Returns `None` for anything [`Display`](fmt::Display)
    /// would not have produced.
    pub fn parse(rendered: &str) -> Option<Self> {
        let mut parts = rendered.split(':');
        let scope = match parts.next()? {
            "workflow" => Scope::Workflow,
            "agent" => Scope::Agent,
            _ => return None,
        };
        let scope_id = unescape_component(parts.next()?)?;
        let name = unescape_component(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            scope,
            scope_id,
            name,
        })
    }
}

/// Escape the separator so that distinct keys never render to the same string.
fn escape_component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

fn unescape_component(escaped: &str) -> Option<String> {
    let mut out = String::with_capacity(escaped.len());
    let mut rest = escaped;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "3A" => out.push(':'),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

/// Generate a new sandbox id.
pub fn new_session_id() -> String {
    format!("sbx_{}", uuid::Uuid::new_v4().simple())
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.scope,
            escape_component(&self.scope_id),
            escape_component(&self.name)
        )
    }
}

/// Language shortcut for picking a container image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    /// CPython
    #[default]
    Python,
    /// Node.js
    Node,
    /// Plain POSIX shell environment
    Bash,
}

impl Runtime {
    /// Parse a runtime name. Unknown names fall back to Python.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" | "javascript" => Runtime::Node,
            "bash" | "shell" | "sh" => Runtime::Bash,
            _ => Runtime::Python,
        }
    }

    /// Default container image for this runtime.
    pub fn default_image(&self) -> &'static str {
        match self {
            Runtime::Python => "python:3.11-slim",
            Runtime::Node => "node:20-slim",
            Runtime::Bash => "ubuntu:22.04",
        }
    }
}

/// Configuration a session is created from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Language shortcut, used when `image` is empty.
    pub runtime: Runtime,
    /// Explicit container image reference.
    pub image: Option<String>,
    /// Allow outbound network access.
    pub allow_network: bool,
    /// Working directory inside the sandbox.
    pub workdir: String,
    /// Environment for every process in the sandbox.
    pub env: BTreeMap<String, String>,
    /// Resource limits.
    pub limits: ResourceLimits,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime: Runtime::default(),
            image: None,
            allow_network: false,
            workdir: DEFAULT_WORKDIR.to_string(),
            env: BTreeMap::new(),
            limits: ResourceLimits::default(),
        }
    }
}

impl SessionConfig {
    /// The image to run: the explicit one, otherwise the runtime default.
    pub fn resolved_image(&self) -> String {
        match self.image.as_deref().map(str::trim) {
            Some(image) if !image.is_empty() => image.to_string(),
            _ => self.runtime.default_image().to_string(),
        }
    }

    /// The working directory, never empty.
    pub fn resolved_workdir(&self) -> &str {
        if self.workdir.trim().is_empty() {
            DEFAULT_WORKDIR
        } else {
            &self.workdir
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Reserved in the registry, backend creation in flight.
    Creating,
    /// Idle and reusable.
    Ready,
    /// A tool action is running against it.
    Busy,
    /// The backend resource was found missing or broken.
    Error,
    /// Torn down. Never observed in the registry.
    Destroyed,
}

/// A live sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeSession {
    /// Stable identifier handed to tool callers as `sandbox_id`.
    pub id: String,
    /// Opaque backend handle (a container id for the Docker backend).
    pub container_handle: String,
    /// Registry key.
    pub key: SessionKey,
    /// Configuration the session was created from.
    pub config: SessionConfig,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last time a caller resolved or used the session.
    pub last_used_at: DateTime<Utc>,
}

/// What to run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    /// Program and arguments, executed without a shell.
    Argv(Vec<String>),
    /// A single command line, executed with `sh -c`.
    Shell(String),
}

impl Command {
    /// Argument vector to hand to the engine.
    pub fn to_argv(&self) -> Vec<String> {
        match self {
            Command::Argv(argv) => argv.clone(),
            Command::Shell(line) => vec!["sh".to_string(), "-c".to_string(), line.clone()],
        }
    }

    /// Whether there is nothing to run.
    pub fn is_empty(&self) -> bool {
        match self {
            Command::Argv(argv) => argv.first().is_none_or(|program| program.trim().is_empty()),
            Command::Shell(line) => line.trim().is_empty(),
        }
    }
}

/// A command execution request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecRequest {
    /// What to run.
    pub command: Command,
    /// Working directory override (relative paths resolve against the session workdir).
    pub workdir: Option<String>,
    /// Extra environment for this call only.
    pub env: BTreeMap<String, String>,
    /// Deadline for this call, independent of the session limits.
    pub timeout: Duration,
    /// Per-stream capture ceiling.
    pub max_output_bytes: u64,
}

impl ExecRequest {
    /// Request with default timeout and capture ceiling.
    pub fn new(command: Command) -> Self {
        let limits = ResourceLimits::default();
        Self {
            command,
            workdir: None,
            env: BTreeMap::new(),
            timeout: limits.timeout,
            max_output_bytes: limits.max_output_bytes,
        }
    }

    /// Request for an argument vector.
    pub fn argv<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Command::Argv(argv.into_iter().map(Into::into).collect()))
    }

    /// Request for a shell line.
    pub fn shell(line: impl Into<String>) -> Self {
        Self::new(Command::Shell(line.into()))
    }

    /// Set the deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the working directory.
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the per-stream capture ceiling.
    pub fn with_max_output_bytes(mut self, max: u64) -> Self {
        self.max_output_bytes = max;
        self
    }
}

/// Outcome of a command. Non-zero exit, timeout and truncation are all data.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    /// Exit code, `-1` when the process had not exited when the deadline passed.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
    /// Wall-clock duration of the call.
    pub duration: Duration,
    /// The deadline passed before the process finished.
    pub timed_out: bool,
    /// At least one stream exceeded the capture ceiling.
    pub truncated: bool,
}

impl ExecResult {
    /// Whether the command exited zero within its deadline.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Standard output as lossy text.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error as lossy text.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Kind of a listed filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Regular file (and anything that is not a directory or link)
    File,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Base name.
    pub name: String,
    /// Absolute path inside the sandbox. The tool surface renders it relative
    /// to the working directory.
    pub path: String,
    /// Entry kind.
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Modification time, when the backend reports one.
    pub modified_at: Option<DateTime<Utc>>,
}

/// Bytes read out of a sandbox file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    /// The bytes, at most the requested ceiling.
    pub data: Vec<u8>,
    /// Full size of the file as reported by the backend.
    pub size_bytes: u64,
    /// `data` holds only a prefix of the file.
    pub truncated: bool,
}

/// Scope identifiers supplied by the workflow/agent engine for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Workflow run id, empty outside a workflow.
    pub workflow_run_id: String,
    /// Agent run id.
    pub agent_run_id: String,
    /// Agent name, used for logging only.
    pub agent_name: String,
    /// Session name configured for the agent, empty for the default.
    pub session_name: String,
}

impl ExecutionContext {
    /// Context for a standalone agent run.
    pub fn agent(agent_run_id: impl Into<String>) -> Self {
        Self {
            agent_run_id: agent_run_id.into(),
            ..Self::default()
        }
    }

    /// Context for an agent step inside a workflow run.
    pub fn workflow(workflow_run_id: impl Into<String>, agent_run_id: impl Into<String>) -> Self {
        Self {
            workflow_run_id: workflow_run_id.into(),
            agent_run_id: agent_run_id.into(),
            ..Self::default()
        }
    }

    /// Resolve the session key for this context.
    ///
    /// A workflow run id wins over the agent run id so that every step of a
    /// workflow shares one sandbox. `name_override` replaces the configured
    /// session name. Returns `None` when neither id is set.
    pub fn resolve_key(&self, name_override: Option<&str>) -> Option<SessionKey> {
        let name = name_override
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| Some(self.session_name.trim()).filter(|n| !n.is_empty()))
            .unwrap_or(DEFAULT_SESSION_NAME);

        if !self.workflow_run_id.trim().is_empty() {
            Some(SessionKey::named(
                Scope::Workflow,
                self.workflow_run_id.trim(),
                name,
            ))
        } else if !self.agent_run_id.trim().is_empty() {
            Some(SessionKey::named(Scope::Agent, self.agent_run_id.trim(), name))
        } else {
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::workflow("run-123");
        assert_eq!(key.to_string(), "workflow:run-123:default");

        let key = SessionKey::named(Scope::Agent, "agent-456", "scratch");
        assert_eq!(key.to_string(), "agent:agent-456:scratch");
    }

    #[test]
    fn test_session_key_display_is_deterministic() {
        let a = SessionKey::workflow("wf-1");
        let b = SessionKey::workflow("wf-1");
        assert_eq!(a.to_string(), b.to_string());
    }

    #[test]
    fn test_session_key_display_is_injective() {
        // Separator and escape characters inside ids must not create collisions.
        let keys = [
            SessionKey::named(Scope::Workflow, "a", "b:c"),
            SessionKey::named(Scope::Workflow, "a:b", "c"),
            SessionKey::named(Scope::Workflow, "a%3Ab", "c"),
            SessionKey::named(Scope::Agent, "a:b", "c"),
            SessionKey::named(Scope::Agent, "a", "b:c"),
            SessionKey::workflow("a"),
            SessionKey::agent("a"),
        ];
        let rendered: HashSet<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(rendered.len(), keys.len());
    }

    #[test]
    fn test_session_key_parse_inverts_display() {
        let keys = [
            SessionKey::workflow("run-123"),
            SessionKey::named(Scope::Agent, "a:b%c", "x:%3A"),
            SessionKey::named(Scope::Workflow, "", ""),
        ];
        for key in keys {
            assert_eq!(SessionKey::parse(&key.to_string()), Some(key));
        }
        assert_eq!(SessionKey::parse("tenant:x:y"), None);
        assert_eq!(SessionKey::parse("agent:x"), None);
        assert_eq!(SessionKey::parse("agent:x:y:z"), None);
        assert_eq!(SessionKey::parse("agent:%zz:y"), None);
    }

    #[test]
    fn test_scope_prefix_covers_named_sessions() {
        let prefix = SessionKey::scope_prefix(Scope::Workflow, "run:1");
        assert!(SessionKey::workflow("run:1").to_string().starts_with(&prefix));
        assert!(
            SessionKey::named(Scope::Workflow, "run:1", "scratch")
                .to_string()
                .starts_with(&prefix)
        );
        assert!(!SessionKey::workflow("run:10").to_string().starts_with(&prefix));
        assert!(!SessionKey::agent("run:1").to_string().starts_with(&prefix));
    }

    #[test]
    fn test_new_session_id_is_unique() {
        let a = new_session_id();
        assert!(a.starts_with("sbx_"));
        assert_ne!(a, new_session_id());
    }

    #[test]
    fn test_resolve_key_prefers_workflow() {
        let ctx = ExecutionContext::workflow("wf-123", "agent-456");
        let key = ctx.resolve_key(None).unwrap();
        assert_eq!(key.scope, Scope::Workflow);
        assert_eq!(key.scope_id, "wf-123");
        assert_eq!(key.name, DEFAULT_SESSION_NAME);
    }

    #[test]
    fn test_resolve_key_agent_with_override() {
        let ctx = ExecutionContext::agent("agent-456");
        let key = ctx.resolve_key(Some("custom")).unwrap();
        assert_eq!(key.scope, Scope::Agent);
        assert_eq!(key.scope_id, "agent-456");
        assert_eq!(key.name, "custom");
    }

    #[test]
    fn test_resolve_key_uses_configured_name() {
        let ctx = ExecutionContext {
            session_name: "isolated".into(),
            ..ExecutionContext::agent("agent-1")
        };
        assert_eq!(ctx.resolve_key(None).unwrap().name, "isolated");
        assert_eq!(ctx.resolve_key(Some("  ")).unwrap().name, "isolated");
    }

    #[test]
    fn test_resolve_key_without_ids() {
        assert!(ExecutionContext::default().resolve_key(None).is_none());
    }

    #[test]
    fn test_runtime_images() {
        assert_eq!(Runtime::parse("python").default_image(), "python:3.11-slim");
        assert_eq!(Runtime::parse("node").default_image(), "node:20-slim");
        assert_eq!(Runtime::parse("bash").default_image(), "ubuntu:22.04");
        assert_eq!(Runtime::parse("cobol").default_image(), "python:3.11-slim");
    }

    #[test]
    fn test_config_resolved_image() {
        let mut config = SessionConfig {
            runtime: Runtime::Node,
            ..SessionConfig::default()
        };
        assert_eq!(config.resolved_image(), "node:20-slim");

        config.image = Some("ghcr.io/acme/tools:1".into());
        assert_eq!(config.resolved_image(), "ghcr.io/acme/tools:1");

        config.image = Some("   ".into());
        assert_eq!(config.resolved_image(), "node:20-slim");
    }

    #[test]
    fn test_command_argv() {
        assert_eq!(
            Command::Shell("echo hi".into()).to_argv(),
            vec!["sh", "-c", "echo hi"]
        );
        assert!(Command::Argv(vec![]).is_empty());
        assert!(Command::Argv(vec![" ".into()]).is_empty());
        assert!(Command::Shell("\n".into()).is_empty());
        assert!(!Command::Argv(vec!["ls".into()]).is_empty());
    }

    #[test]
    fn test_file_entry_serializes_type_field() {
        let entry = FileEntry {
            name: "main.py".into(),
            path: "src/main.py".into(),
            file_type: FileType::File,
            size_bytes: 12,
            modified_at: None,
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["path"], "src/main.py");
    }
}
