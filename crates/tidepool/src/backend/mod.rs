//! Execution backends.
//!
//! A backend owns sandbox resources (containers, VMs, ...) and nothing else.
//! It never sees the session registry: the [`SessionManager`](crate::SessionManager)
//! decides when sessions are created and destroyed, and the tool surface
//! borrows sessions through it.
//!
//! Infrastructure failures are [`BackendError`]s. Command failures are not:
//! a non-zero exit code, a timeout or truncated output come back inside
//! [`ExecResult`].

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{
    CodeSession, ExecRequest, ExecResult, FileContent, FileEntry, SessionConfig, SessionKey,
};

pub(crate) mod archive;
mod docker;
pub(crate) mod listing;
mod memory;

pub use docker::DockerBackend;
pub use memory::{CannedOutput, ExecHandler, MemoryBackend};

/// Infrastructure errors reported by a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The engine could not be reached.
    #[error("container engine unavailable: {0}")]
    Unavailable(String),
    /// The handle does not name a live sandbox.
    #[error("sandbox not found: {0}")]
    SessionNotFound(String),
    /// The path does not exist in the sandbox.
    #[error("file not found: {0}")]
    FileNotFound(String),
    /// The path exists but is not a regular file.
    #[error("not a regular file: {0}")]
    NotAFile(String),
    /// The path is a directory and the operation needs an explicit recursive flag.
    #[error("{0} is a directory (set recursive to remove it)")]
    IsADirectory(String),
    /// The engine rejected an API call.
    #[error("{operation} failed: {message}")]
    Engine {
        /// Engine operation that failed
        operation: &'static str,
        /// Engine message
        message: String,
    },
    /// An archive could not be built or read.
    #[error("archive error: {0}")]
    Archive(String),
    /// A filesystem primitive inside the sandbox exited non-zero.
    #[error("{operation} exited with code {exit_code}: {stderr}")]
    Primitive {
        /// Primitive that failed
        operation: &'static str,
        /// Its exit code
        exit_code: i64,
        /// Its standard error
        stderr: String,
    },
    /// Local I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the error means the sandbox itself is gone.
    pub fn is_session_gone(&self) -> bool {
        matches!(self, BackendError::SessionNotFound(_))
    }
}

/// Capability set every execution backend provides.
///
/// Handles are opaque to callers. Paths are absolute sandbox paths; callers
/// resolve relative paths against the session working directory first.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Create and start a sandbox for `key`.
    async fn create_session(
        &self,
        key: &SessionKey,
        config: &SessionConfig,
    ) -> Result<CodeSession, BackendError>;

    /// Tear a sandbox down. Destroying an already-gone sandbox is not an error.
    async fn destroy_session(&self, handle: &str) -> Result<(), BackendError>;

    /// Describe a live sandbox.
    async fn get_session(&self, handle: &str) -> Result<CodeSession, BackendError>;

    /// Run a command.
    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecResult, BackendError>;

    /// Write `content` to `path`, creating parent directories.
    async fn write_file(
        &self,
        handle: &str,
        path: &str,
        content: &[u8],
        mode: u32,
    ) -> Result<(), BackendError>;

    /// Read a regular file, keeping at most `max_bytes` when set.
    async fn read_file(
        &self,
        handle: &str,
        path: &str,
        max_bytes: Option<u64>,
    ) -> Result<FileContent, BackendError>;

    /// List the entries under a directory.
    async fn list_files(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<Vec<FileEntry>, BackendError>;

    /// Delete a file, or a directory when `recursive` is set.
    async fn delete_file(
        &self,
        handle: &str,
        path: &str,
        recursive: bool,
    ) -> Result<(), BackendError>;
}
