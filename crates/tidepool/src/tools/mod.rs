//! Tool surface exposed to language models.
//!
//! [`SandboxToolkit`] turns model tool calls into session manager and backend
//! operations. Every call after `sandbox_open` addresses its sandbox by the
//! returned `sandbox_id`, and every path is resolved against the sandbox
//! working directory.
//!
//! Command failures are results: a non-zero exit code, a timeout, truncated
//! output or a missing store object all come back as `Ok`. Only malformed
//! input and infrastructure failures are [`ToolError`]s.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::backend::BackendError;
use crate::manager::{SessionError, SessionLease, SessionManager};
use crate::paths;
use crate::session::{
    Command, ExecRequest, ExecResult, ExecutionContext, FileType, Runtime, SessionConfig,
};
use crate::settings::SandboxSettings;
use crate::store::{
    FileStore, PutOptions, StoreError, content_type_for_path, generate_file_id, user_file_key,
};

mod params;
mod schema;

pub use params::*;
pub use schema::{
    DEFAULT_READ_BYTES, MAX_TIMEOUT_SECS, TOOL_CLOSE, TOOL_EXEC, TOOL_FS_DELETE, TOOL_FS_LIST,
    TOOL_FS_READ, TOOL_FS_WRITE, TOOL_OPEN, TOOL_PUBLISH_FILE, TOOL_STAGE_FILE,
};

/// Longest accepted session name.
const MAX_SESSION_NAME_LEN: usize = 128;

/// Full definition of a tool including its parameter schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (unique identifier).
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's parameters.
    #[serde(default)]
    pub parameters: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Something that can list tool definitions.
pub trait ToolRegistry: Send + Sync {
    /// All available tools.
    fn list_tools(&self) -> Vec<ToolDefinition>;

    /// Definition of one tool.
    fn get_tool(&self, name: &str) -> Option<ToolDefinition> {
        self.list_tools().into_iter().find(|t| t.name == name)
    }

    /// Check if a tool exists.
    fn has_tool(&self, name: &str) -> bool {
        self.get_tool(name).is_some()
    }
}

/// Errors returned by tool calls.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The input is malformed. Nothing was touched.
    #[error("{tool}: {message}")]
    Validation {
        /// Tool name
        tool: &'static str,
        /// Offending input field
        field: String,
        /// What is wrong with it
        message: String,
    },
    /// No tool with this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    /// The input is well formed but exceeds a session limit.
    #[error("{tool}: {message}")]
    LimitExceeded {
        /// Tool name
        tool: &'static str,
        /// Which limit and by how much
        message: String,
    },
    /// The target already exists and overwriting was not requested.
    #[error("{tool}: {path} already exists")]
    AlreadyExists {
        /// Tool name
        tool: &'static str,
        /// Path relative to the workdir
        path: String,
    },
    /// Session lookup or lifecycle failure.
    #[error("{tool}: {source}")]
    Session {
        /// Tool name
        tool: &'static str,
        /// Manager error
        #[source]
        source: SessionError,
    },
    /// Backend failure.
    #[error("{tool}: {source}")]
    Backend {
        /// Tool name
        tool: &'static str,
        /// Backend error
        #[source]
        source: BackendError,
    },
    /// File store failure.
    #[error("{tool}: {source}")]
    Store {
        /// Tool name
        tool: &'static str,
        /// Store error
        #[source]
        source: StoreError,
    },
    /// The tool is not usable in this process.
    #[error("{tool}: {message}")]
    Unavailable {
        /// Tool name
        tool: &'static str,
        /// Why
        message: String,
    },
    /// The result could not be encoded.
    #[error("{tool}: encoding result: {source}")]
    Encode {
        /// Tool name
        tool: &'static str,
        /// Encoder error
        #[source]
        source: serde_json::Error,
    },
}

impl ToolError {
    /// Whether the caller sent bad input, as opposed to something failing.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ToolError::Validation { .. } | ToolError::UnknownTool(_)
        )
    }

    fn validation(tool: &'static str, field: &str, message: impl Into<String>) -> Self {
        ToolError::Validation {
            tool,
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Per-agent sandbox preferences. Unset fields fall back to [`SandboxSettings`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentDefaults {
    /// Runtime shortcut. Setting it discards the process-wide default image.
    pub runtime: Option<Runtime>,
    /// Explicit image.
    pub image: Option<String>,
    /// Network access.
    pub allow_network: Option<bool>,
    /// Exec timeout ceiling in seconds, also the default for calls that omit one.
    pub timeout_secs: Option<u64>,
}

/// Builder for [`SandboxToolkit`].
pub struct SandboxToolkitBuilder {
    manager: Arc<SessionManager>,
    settings: SandboxSettings,
    defaults: AgentDefaults,
    store: Option<Arc<dyn FileStore>>,
}

impl fmt::Debug for SandboxToolkitBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxToolkitBuilder")
            .field("defaults", &self.defaults)
            .field("file_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl SandboxToolkitBuilder {
    /// Process-wide settings used to build session configurations.
    pub fn settings(mut self, settings: SandboxSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Agent preferences applied on top of the settings.
    pub fn defaults(mut self, defaults: AgentDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Enable `sandbox_stage_file` and `sandbox_publish_file`.
    pub fn file_store(mut self, store: Arc<dyn FileStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Build the toolkit.
    pub fn build(self) -> SandboxToolkit {
        SandboxToolkit {
            manager: self.manager,
            settings: self.settings,
            defaults: self.defaults,
            store: self.store,
        }
    }
}

/// The sandbox tools, bound to a session manager.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use serde_json::json;
/// use tidepool::{ExecutionContext, MemoryBackend, SandboxToolkit, SessionManager};
///
/// let manager = Arc::new(SessionManager::new(Arc::new(MemoryBackend::new())));
/// let tools = SandboxToolkit::builder(manager).build();
/// let ctx = ExecutionContext::workflow("run-1", "agent-1");
///
/// let opened = tools.call("sandbox_open", json!({}), &ctx).await?;
/// let result = tools
///     .call(
///         "sandbox_exec",
///         json!({"sandbox_id": opened["sandbox_id"], "cmd": ["echo", "hi"]}),
///         &ctx,
///     )
///     .await?;
/// assert_eq!(result["stdout"], "hi\n");
/// ```
pub struct SandboxToolkit {
    manager: Arc<SessionManager>,
    settings: SandboxSettings,
    defaults: AgentDefaults,
    store: Option<Arc<dyn FileStore>>,
}

impl fmt::Debug for SandboxToolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxToolkit")
            .field("manager", &self.manager)
            .field("defaults", &self.defaults)
            .field("file_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl ToolRegistry for SandboxToolkit {
    fn list_tools(&self) -> Vec<ToolDefinition> {
        self.definitions()
    }
}

impl SandboxToolkit {
    /// Start building a toolkit over `manager`.
    pub fn builder(manager: Arc<SessionManager>) -> SandboxToolkitBuilder {
        SandboxToolkitBuilder {
            manager,
            settings: SandboxSettings::default(),
            defaults: AgentDefaults::default(),
            store: None,
        }
    }

    /// The session manager.
    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Tools this toolkit serves. The file tools are listed only with a store.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let timeout = ceiling(self.session_config().limits.timeout);
        let mut definitions = schema::core_definitions(timeout.as_secs());
        if self.store.is_some() {
            definitions.extend(schema::store_definitions());
        }
        definitions
    }

    /// Configuration for sessions opened through this toolkit.
    pub fn session_config(&self) -> SessionConfig {
        let mut config = self.settings.session_config();
        if let Some(runtime) = self.defaults.runtime {
            config.runtime = runtime;
            config.image = None;
        }
        if let Some(image) = self.defaults.image.as_deref().map(str::trim)
            && !image.is_empty()
        {
            config.image = Some(image.to_string());
        }
        if let Some(allow) = self.defaults.allow_network {
            config.allow_network = allow;
        }
        if let Some(secs) = self.defaults.timeout_secs {
            config.limits.timeout = Duration::from_secs(secs);
        }
        config
    }

    /// Dispatch a call by tool name with raw JSON arguments.
    pub async fn call(
        &self,
        name: &str,
        input: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, ToolError> {
        match name {
            TOOL_OPEN => encode(TOOL_OPEN, self.open(ctx, parse(TOOL_OPEN, input)?).await?),
            TOOL_EXEC => encode(TOOL_EXEC, self.exec(parse(TOOL_EXEC, input)?).await?),
            TOOL_FS_WRITE => encode(
                TOOL_FS_WRITE,
                self.fs_write(parse(TOOL_FS_WRITE, input)?).await?,
            ),
            TOOL_FS_READ => encode(TOOL_FS_READ, self.fs_read(parse(TOOL_FS_READ, input)?).await?),
            TOOL_FS_LIST => encode(TOOL_FS_LIST, self.fs_list(parse(TOOL_FS_LIST, input)?).await?),
            TOOL_FS_DELETE => encode(
                TOOL_FS_DELETE,
                self.fs_delete(parse(TOOL_FS_DELETE, input)?).await?,
            ),
            TOOL_CLOSE => encode(TOOL_CLOSE, self.close(parse(TOOL_CLOSE, input)?).await?),
            TOOL_STAGE_FILE => encode(
                TOOL_STAGE_FILE,
                self.stage_file(parse(TOOL_STAGE_FILE, input)?).await?,
            ),
            TOOL_PUBLISH_FILE => encode(
                TOOL_PUBLISH_FILE,
                self.publish_file(parse(TOOL_PUBLISH_FILE, input)?).await?,
            ),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// Open the sandbox of the current run, creating it on first use.
    pub async fn open(
        &self,
        ctx: &ExecutionContext,
        input: OpenInput,
    ) -> Result<OpenOutput, ToolError> {
        let name = input
            .session_key
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty());
        if let Some(name) = name {
            validate_session_name(name)?;
        }
        let key = ctx.resolve_key(name).ok_or_else(|| ToolError::Unavailable {
            tool: TOOL_OPEN,
            message: "no workflow or agent run id in the execution context".into(),
        })?;

        let (session, created) = self
            .manager
            .get_or_create_session(&key, &self.session_config())
            .await
            .map_err(|source| ToolError::Session {
                tool: TOOL_OPEN,
                source,
            })?;
        tracing::info!(
            session_key = %key,
            session_id = %session.id,
            agent = %ctx.agent_name,
            created,
            "sandbox opened"
        );
        Ok(OpenOutput {
            image: session.config.resolved_image(),
            workdir: session.config.resolved_workdir().to_string(),
            sandbox_id: session.id,
            created,
        })
    }

    /// Run a command.
    pub async fn exec(&self, input: ExecInput) -> Result<ExecOutput, ToolError> {
        let id = required(TOOL_EXEC, "sandbox_id", &input.sandbox_id)?;
        let command = match input.cmd {
            CommandInput::Argv(argv) => Command::Argv(argv),
            CommandInput::Line(line) => Command::Shell(line),
        };
        if command.is_empty() {
            return Err(ToolError::validation(TOOL_EXEC, "cmd", "cmd is required"));
        }
        if let Some(name) = input
            .env
            .keys()
            .find(|name| name.is_empty() || name.contains(['=', '\0']))
        {
            return Err(ToolError::validation(
                TOOL_EXEC,
                "env",
                format!("invalid environment variable name {name:?}"),
            ));
        }
        let timeout = match input.timeout_seconds {
            None => None,
            Some(secs) if (1..=MAX_TIMEOUT_SECS).contains(&secs) => Some(Duration::from_secs(secs)),
            Some(secs) => {
                return Err(ToolError::validation(
                    TOOL_EXEC,
                    "timeout_seconds",
                    format!("timeout_seconds must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}"),
                ));
            }
        };

        let lease = self.lease(TOOL_EXEC, id)?;
        let config = lease.config();
        let limit = ceiling(config.limits.timeout);
        let mut request = ExecRequest::new(command)
            .with_timeout(timeout.map_or(limit, |t| t.min(limit)))
            .with_max_output_bytes(config.limits.max_output_bytes);
        if let Some(cwd) = input.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            request = request.with_workdir(paths::resolve(config.resolved_workdir(), cwd));
        }
        request.env = input.env;

        let result = self
            .manager
            .backend()
            .exec(lease.handle(), &request)
            .await
            .map_err(|e| backend_error(TOOL_EXEC, &lease, e))?;
        tracing::debug!(
            session_id = %lease.session().id,
            exit_code = result.exit_code,
            timed_out = result.timed_out,
            truncated = result.truncated,
            duration_ms = result.duration.as_millis() as u64,
            "exec finished"
        );
        Ok(ExecOutput::from(result))
    }

    /// Write a file.
    pub async fn fs_write(&self, input: FsWriteInput) -> Result<FsWriteOutput, ToolError> {
        const TOOL: &str = TOOL_FS_WRITE;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let path = required(TOOL, "path", &input.path)?;
        reject_traversal(TOOL, "path", path)?;
        let content = match (input.contents, input.contents_b64) {
            (Some(_), Some(_)) => {
                return Err(ToolError::validation(
                    TOOL,
                    "contents_b64",
                    "provide contents or contents_b64, not both",
                ));
            }
            (Some(text), None) => text.into_bytes(),
            (None, Some(encoded)) => BASE64.decode(encoded.trim()).map_err(|e| {
                ToolError::validation(TOOL, "contents_b64", format!("invalid base64: {e}"))
            })?,
            (None, None) => Vec::new(),
        };
        let mode = parse_mode(input.mode.as_deref())
            .map_err(|message| ToolError::validation(TOOL, "mode", message))?;

        let lease = self.lease(TOOL, id)?;
        let config = lease.config();
        let workdir = config.resolved_workdir();
        let target = paths::resolve(workdir, path);
        let relative = paths::relative_to(workdir, &target);
        check_file_size(TOOL, content.len() as u64, config.limits.max_file_bytes)?;

        let backend = self.manager.backend();
        let mut exists = None;
        if !input.overwrite {
            let found = self
                .exists(&lease, &target)
                .await
                .map_err(|e| backend_error(TOOL, &lease, e))?;
            if found {
                return Err(ToolError::AlreadyExists {
                    tool: TOOL,
                    path: relative,
                });
            }
            exists = Some(found);
        }
        let max_files = config.limits.max_files;
        if max_files > 0 {
            let count = self
                .count_files(&lease, workdir)
                .await
                .map_err(|e| backend_error(TOOL, &lease, e))?;
            if count >= max_files {
                let replacing = match exists {
                    Some(found) => found,
                    None => self
                        .exists(&lease, &target)
                        .await
                        .map_err(|e| backend_error(TOOL, &lease, e))?,
                };
                if !replacing {
                    return Err(ToolError::LimitExceeded {
                        tool: TOOL,
                        message: format!(
                            "sandbox already holds {count} files, the limit is {max_files}"
                        ),
                    });
                }
            }
        }

        backend
            .write_file(lease.handle(), &target, &content, mode)
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;
        tracing::debug!(
            path = %target,
            size = content.len(),
            mode = %format_args!("{mode:o}"),
            "file written"
        );
        Ok(FsWriteOutput {
            ok: true,
            path: relative,
            size_bytes: content.len() as u64,
        })
    }

    /// Read a file.
    pub async fn fs_read(&self, input: FsReadInput) -> Result<FsReadOutput, ToolError> {
        const TOOL: &str = TOOL_FS_READ;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let path = required(TOOL, "path", &input.path)?;
        reject_traversal(TOOL, "path", path)?;
        let max_bytes = input.max_bytes.unwrap_or(DEFAULT_READ_BYTES);
        if max_bytes == 0 {
            return Err(ToolError::validation(
                TOOL,
                "max_bytes",
                "max_bytes must be at least 1",
            ));
        }

        let lease = self.lease(TOOL, id)?;
        let workdir = lease.config().resolved_workdir();
        let target = paths::resolve(workdir, path);
        let content = self
            .manager
            .backend()
            .read_file(lease.handle(), &target, Some(max_bytes))
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;

        let (contents, contents_b64) = match decode_text(content.data, content.truncated) {
            Ok(text) => (Some(text), None),
            Err(bytes) => (None, Some(BASE64.encode(bytes))),
        };
        Ok(FsReadOutput {
            path: paths::relative_to(workdir, &target),
            contents,
            contents_b64,
            truncated: content.truncated,
            size_bytes: content.size_bytes,
        })
    }

    /// List a directory.
    pub async fn fs_list(&self, input: FsListInput) -> Result<FsListOutput, ToolError> {
        const TOOL: &str = TOOL_FS_LIST;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let path = input.path.as_deref().unwrap_or(".");
        reject_traversal(TOOL, "path", path)?;

        let lease = self.lease(TOOL, id)?;
        let workdir = lease.config().resolved_workdir();
        let target = paths::resolve(workdir, path);
        let entries = self
            .manager
            .backend()
            .list_files(lease.handle(), &target, input.recursive)
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;

        Ok(FsListOutput {
            entries: entries
                .into_iter()
                .map(|entry| ListedEntry {
                    path: paths::relative_to(workdir, &entry.path),
                    name: entry.name,
                    file_type: entry.file_type,
                    size_bytes: entry.size_bytes,
                    modified_at: entry.modified_at,
                })
                .collect(),
        })
    }

    /// Delete a file or, with `recursive`, a directory.
    pub async fn fs_delete(&self, input: FsDeleteInput) -> Result<FsDeleteOutput, ToolError> {
        const TOOL: &str = TOOL_FS_DELETE;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let path = required(TOOL, "path", &input.path)?;
        reject_traversal(TOOL, "path", path)?;

        let lease = self.lease(TOOL, id)?;
        let workdir = lease.config().resolved_workdir();
        let target = paths::resolve(workdir, path);
        if target == "/" || target == paths::normalize(workdir) {
            return Err(ToolError::validation(
                TOOL,
                "path",
                "refusing to delete the sandbox root or working directory",
            ));
        }
        self.manager
            .backend()
            .delete_file(lease.handle(), &target, input.recursive)
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;
        tracing::debug!(path = %target, recursive = input.recursive, "path deleted");
        Ok(FsDeleteOutput {
            ok: true,
            deleted: paths::relative_to(workdir, &target),
        })
    }

    /// Destroy a sandbox. Closing an unknown or already closed sandbox succeeds.
    pub async fn close(&self, input: CloseInput) -> Result<CloseOutput, ToolError> {
        let id = required(TOOL_CLOSE, "sandbox_id", &input.sandbox_id)?;
        let closed = self
            .manager
            .close_session(id)
            .await
            .map_err(|source| ToolError::Session {
                tool: TOOL_CLOSE,
                source,
            })?;
        tracing::info!(session_id = id, closed, "sandbox closed");
        Ok(CloseOutput { ok: true, closed })
    }

    /// Copy an object from the file store into a sandbox.
    pub async fn stage_file(&self, input: StageFileInput) -> Result<StageFileOutput, ToolError> {
        const TOOL: &str = TOOL_STAGE_FILE;
        let store = self.store(TOOL)?;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let file_key = required(TOOL, "file_key", &input.file_key)?;
        let destination = required(TOOL, "destination", &input.destination)?;
        reject_traversal(TOOL, "file_key", file_key)?;
        reject_traversal(TOOL, "destination", destination)?;
        reject_absolute(TOOL, "destination", destination)?;

        let lease = self.lease(TOOL, id)?;
        let config = lease.config();
        let workdir = config.resolved_workdir();
        let target = paths::resolve(workdir, destination);
        let relative = paths::relative_to(workdir, &target);

        let data = match store.get(file_key).await {
            Ok((data, _)) => data,
            Err(e @ StoreError::NotFound(_)) => {
                tracing::debug!(file_key, "staged file not in store");
                return Ok(StageFileOutput {
                    ok: false,
                    path: relative,
                    size_bytes: 0,
                    error: Some(e.to_string()),
                });
            }
            Err(source) => return Err(ToolError::Store { tool: TOOL, source }),
        };
        let data = match input.encoding {
            Encoding::Text => data,
            Encoding::Base64 => {
                let text = String::from_utf8_lossy(&data);
                let cleaned: String = text.split_whitespace().collect();
                BASE64.decode(cleaned).map_err(|e| {
                    ToolError::validation(
                        TOOL,
                        "encoding",
                        format!("{file_key} is not valid base64: {e}"),
                    )
                })?
            }
        };
        check_file_size(TOOL, data.len() as u64, config.limits.max_file_bytes)?;

        self.manager
            .backend()
            .write_file(lease.handle(), &target, &data, 0o644)
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;
        tracing::info!(file_key, path = %target, size = data.len(), "file staged");
        Ok(StageFileOutput {
            ok: true,
            path: relative,
            size_bytes: data.len() as u64,
            error: None,
        })
    }

    /// Copy a sandbox file into the file store.
    pub async fn publish_file(
        &self,
        input: PublishFileInput,
    ) -> Result<PublishFileOutput, ToolError> {
        const TOOL: &str = TOOL_PUBLISH_FILE;
        let store = self.store(TOOL)?;
        let id = required(TOOL, "sandbox_id", &input.sandbox_id)?;
        let source = required(TOOL, "source", &input.source)?;
        reject_traversal(TOOL, "source", source)?;
        reject_absolute(TOOL, "source", source)?;
        let file_key = match input.file_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => {
                reject_traversal(TOOL, "file_key", key)?;
                key.to_string()
            }
            _ => user_file_key(&generate_file_id()),
        };

        let lease = self.lease(TOOL, id)?;
        let config = lease.config();
        let workdir = config.resolved_workdir();
        let target = paths::resolve(workdir, source);
        let max_file_bytes = config.limits.max_file_bytes;
        let content = self
            .manager
            .backend()
            .read_file(lease.handle(), &target, Some(max_file_bytes))
            .await
            .map_err(|e| backend_error(TOOL, &lease, e))?;
        check_file_size(TOOL, content.size_bytes, max_file_bytes)?;

        let mut metadata = BTreeMap::new();
        metadata.insert(
            "original_path".to_string(),
            paths::relative_to(workdir, &target),
        );
        metadata.insert("sandbox_id".to_string(), lease.session().id);
        let data = match input.encoding {
            Encoding::Text => content.data,
            Encoding::Base64 => {
                metadata.insert("encoding".to_string(), "base64".to_string());
                BASE64.encode(content.data).into_bytes()
            }
        };
        let options = PutOptions {
            content_type: content_type_for_path(&target).to_string(),
            description: paths::file_name(&target).to_string(),
            metadata,
        };
        let info = store
            .put(&file_key, data, options)
            .await
            .map_err(|source| ToolError::Store { tool: TOOL, source })?;
        tracing::info!(file_key = %info.key, path = %target, size = info.size_bytes, "file published");
        Ok(PublishFileOutput {
            ok: true,
            file_key: info.key,
            size_bytes: info.size_bytes,
            content_type: info.content_type,
        })
    }

    fn lease(&self, tool: &'static str, id: &str) -> Result<SessionLease, ToolError> {
        self.manager
            .lease(id)
            .map_err(|source| ToolError::Session { tool, source })
    }

    fn store(&self, tool: &'static str) -> Result<&Arc<dyn FileStore>, ToolError> {
        self.store.as_ref().ok_or_else(|| ToolError::Unavailable {
            tool,
            message: "no file store is configured".into(),
        })
    }

    async fn exists(&self, lease: &SessionLease, path: &str) -> Result<bool, BackendError> {
        match self
            .manager
            .backend()
            .read_file(lease.handle(), path, Some(0))
            .await
        {
            Ok(_) | Err(BackendError::NotAFile(_)) => Ok(true),
            Err(BackendError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn count_files(&self, lease: &SessionLease, workdir: &str) -> Result<u64, BackendError> {
        match self
            .manager
            .backend()
            .list_files(lease.handle(), workdir, true)
            .await
        {
            Ok(entries) => Ok(entries
                .iter()
                .filter(|entry| entry.file_type == FileType::File)
                .count() as u64),
            Err(BackendError::FileNotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl From<ExecResult> for ExecOutput {
    fn from(result: ExecResult) -> Self {
        let (stdout, stdout_b64) = text_and_exact(result.stdout);
        let (stderr, stderr_b64) = text_and_exact(result.stderr);
        ExecOutput {
            exit_code: result.exit_code,
            stdout,
            stdout_b64,
            stderr,
            stderr_b64,
            timed_out: result.timed_out,
            truncated: result.truncated,
            duration_ms: result.duration.as_millis() as u64,
        }
    }
}

fn parse<T: DeserializeOwned>(tool: &'static str, input: Value) -> Result<T, ToolError> {
    let input = if input.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        input
    };
    serde_json::from_value(input).map_err(|e| {
        let message = e.to_string();
        let field = quoted_field(&message).unwrap_or("arguments").to_string();
        ToolError::Validation {
            tool,
            field,
            message: format!("invalid arguments: {message}"),
        }
    })
}

fn encode<T: Serialize>(tool: &'static str, output: T) -> Result<Value, ToolError> {
    serde_json::to_value(output).map_err(|source| ToolError::Encode { tool, source })
}

/// The first backtick-quoted name in a serde error message.
fn quoted_field(message: &str) -> Option<&str> {
    let start = message.find('`')? + 1;
    let len = message[start..].find('`')?;
    Some(&message[start..start + len])
}

fn required<'a>(tool: &'static str, field: &str, value: &'a str) -> Result<&'a str, ToolError> {
    let value = value.trim();
    if value.is_empty() {
        Err(ToolError::validation(tool, field, format!("{field} is required")))
    } else {
        Ok(value)
    }
}

fn reject_traversal(tool: &'static str, field: &str, value: &str) -> Result<(), ToolError> {
    if paths::has_traversal(value) {
        Err(ToolError::validation(tool, field, "path traversal not allowed"))
    } else {
        Ok(())
    }
}

fn reject_absolute(tool: &'static str, field: &str, value: &str) -> Result<(), ToolError> {
    if value.starts_with('/') {
        Err(ToolError::validation(
            tool,
            field,
            format!("{field} must be relative to the sandbox workdir"),
        ))
    } else {
        Ok(())
    }
}

fn validate_session_name(name: &str) -> Result<(), ToolError> {
    if name.chars().count() > MAX_SESSION_NAME_LEN {
        return Err(ToolError::validation(
            TOOL_OPEN,
            "session_key",
            format!("session_key is longer than {MAX_SESSION_NAME_LEN} characters"),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(ToolError::validation(
            TOOL_OPEN,
            "session_key",
            "session_key must not contain control characters",
        ));
    }
    Ok(())
}

fn check_file_size(tool: &'static str, size: u64, max: u64) -> Result<(), ToolError> {
    if size > max {
        Err(ToolError::LimitExceeded {
            tool,
            message: format!("file is {size} bytes, the limit is {max}"),
        })
    } else {
        Ok(())
    }
}

fn backend_error(tool: &'static str, lease: &SessionLease, source: BackendError) -> ToolError {
    lease.observe(&source);
    ToolError::Backend { tool, source }
}

/// Longest exec deadline a session allows, also its default.
fn ceiling(timeout: Duration) -> Duration {
    Duration::from_secs(timeout.as_secs().clamp(1, MAX_TIMEOUT_SECS))
}

/// Parse octal permission bits, `0644` when absent.
fn parse_mode(mode: Option<&str>) -> Result<u32, String> {
    let Some(raw) = mode.map(str::trim).filter(|m| !m.is_empty()) else {
        return Ok(0o644);
    };
    let digits = raw.strip_prefix("0o").unwrap_or(raw);
    match u32::from_str_radix(digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(mode),
        _ => Err(format!("mode must be octal permission bits like 0644, got {raw:?}")),
    }
}

/// Bytes as text, or back as bytes when they are not UTF-8.
///
/// A truncated read may end inside a multi-byte character; that partial
/// character is dropped instead of forcing base64.
fn decode_text(data: Vec<u8>, truncated: bool) -> Result<String, Vec<u8>> {
    match String::from_utf8(data) {
        Ok(text) => Ok(text),
        Err(e) if truncated && e.utf8_error().error_len().is_none() => {
            let valid = e.utf8_error().valid_up_to();
            let mut bytes = e.into_bytes();
            bytes.truncate(valid);
            String::from_utf8(bytes).map_err(|e| e.into_bytes())
        }
        Err(e) => Err(e.into_bytes()),
    }
}

/// Lossy text plus the exact base64 form when the bytes are not UTF-8.
fn text_and_exact(bytes: Vec<u8>) -> (String, Option<String>) {
    match String::from_utf8(bytes) {
        Ok(text) => (text, None),
        Err(e) => {
            let bytes = e.into_bytes();
            (
                String::from_utf8_lossy(&bytes).into_owned(),
                Some(BASE64.encode(&bytes)),
            )
        }
    }
}
