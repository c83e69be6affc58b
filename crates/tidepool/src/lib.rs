//! Tidepool: persistent container sandboxes for agent tool calls
//!
//! Each workflow run (or standalone agent run) gets one long-lived container
//! that survives across tool calls, so files written by one step are there
//! for the next. The [`SessionManager`] owns the registry of live sandboxes,
//! a [`SandboxBackend`] owns the containers, and [`SandboxToolkit`] exposes
//! both to a model as `sandbox_*` tools.

mod backend;
mod limits;
mod manager;
pub mod paths;
mod records;
mod session;
mod settings;
pub mod store;
pub mod tools;

pub use backend::{
    BackendError, CannedOutput, DockerBackend, ExecHandler, MemoryBackend, SandboxBackend,
};
pub use limits::{LimitedBuffer, ResourceLimits};
pub use manager::{SessionError, SessionLease, SessionManager, SessionManagerBuilder};
pub use records::{
    DEFAULT_RECORD_TTL, MemorySessionRecordStore, RecordError, SessionRecord, SessionRecordStore,
};
pub use session::{
    CodeSession, Command, DEFAULT_SESSION_NAME, DEFAULT_WORKDIR, ExecRequest, ExecResult,
    ExecutionContext, FileContent, FileEntry, FileType, Runtime, Scope, SessionConfig, SessionKey,
    SessionStatus, new_session_id,
};
pub use settings::{DEFAULT_ENV_PREFIX, SandboxSettings, forwarded_env};
pub use store::{DirFileStore, FileInfo, FileStore, MemoryFileStore, PutOptions, StoreError};
pub use tools::{AgentDefaults, SandboxToolkit, ToolDefinition, ToolError, ToolRegistry};
