//! Typed inputs and outputs of the sandbox tools.
//!
//! Inputs reject unknown fields so that a misspelled argument fails loudly
//! instead of being ignored.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::FileType;

/// `sandbox_open` input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenInput {
    /// Session name override.
    #[serde(default)]
    pub session_key: Option<String>,
}

/// `sandbox_open` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOutput {
    /// Id to pass to the other tools.
    pub sandbox_id: String,
    /// Container image of the sandbox.
    pub image: String,
    /// Working directory relative paths resolve against.
    pub workdir: String,
    /// The sandbox is new, so previously staged files are not there.
    pub created: bool,
}

/// A command as given to `sandbox_exec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandInput {
    /// Program and arguments.
    Argv(Vec<String>),
    /// Shell command line.
    Line(String),
}

/// `sandbox_exec` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Command to run.
    pub cmd: CommandInput,
    /// Working directory, relative to the sandbox workdir.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Deadline in whole seconds.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// `sandbox_exec` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code, `-1` if the command was still running at the deadline.
    pub exit_code: i64,
    /// Standard output as text (lossy when not valid UTF-8).
    pub stdout: String,
    /// Exact standard output, present only when it is not valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_b64: Option<String>,
    /// Standard error as text (lossy when not valid UTF-8).
    pub stderr: String,
    /// Exact standard error, present only when it is not valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_b64: Option<String>,
    /// The deadline passed before the command finished.
    pub timed_out: bool,
    /// Output exceeded the capture ceiling.
    pub truncated: bool,
    /// Wall-clock duration.
    pub duration_ms: u64,
}

/// `sandbox_fs_write` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsWriteInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Destination path.
    pub path: String,
    /// Text contents.
    #[serde(default)]
    pub contents: Option<String>,
    /// Base64 contents, for binary files.
    #[serde(default)]
    pub contents_b64: Option<String>,
    /// Octal permission bits.
    #[serde(default)]
    pub mode: Option<String>,
    /// Replace an existing file.
    #[serde(default = "default_true")]
    pub overwrite: bool,
}

/// `sandbox_fs_write` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsWriteOutput {
    /// Always true.
    pub ok: bool,
    /// Path written, relative to the workdir.
    pub path: String,
    /// Bytes written.
    pub size_bytes: u64,
}

/// `sandbox_fs_read` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsReadInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// File to read.
    pub path: String,
    /// Read at most this many bytes.
    #[serde(default)]
    pub max_bytes: Option<u64>,
}

/// `sandbox_fs_read` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsReadOutput {
    /// Path read, relative to the workdir.
    pub path: String,
    /// Contents when they are valid UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    /// Contents as base64 otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents_b64: Option<String>,
    /// Only a prefix of the file was returned.
    pub truncated: bool,
    /// Full size of the file.
    pub size_bytes: u64,
}

/// `sandbox_fs_list` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsListInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Directory to list, the workdir by default.
    #[serde(default)]
    pub path: Option<String>,
    /// Descend into subdirectories.
    #[serde(default)]
    pub recursive: bool,
}

/// One listed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedEntry {
    /// Base name.
    pub name: String,
    /// Path relative to the workdir.
    pub path: String,
    /// Entry kind.
    #[serde(rename = "type")]
    pub file_type: FileType,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Modification time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

/// `sandbox_fs_list` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsListOutput {
    /// Entries sorted by path.
    pub entries: Vec<ListedEntry>,
}

/// `sandbox_fs_delete` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsDeleteInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Path to delete.
    pub path: String,
    /// Required to delete a directory.
    #[serde(default)]
    pub recursive: bool,
}

/// `sandbox_fs_delete` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsDeleteOutput {
    /// Always true.
    pub ok: bool,
    /// Path deleted, relative to the workdir.
    pub deleted: String,
}

/// `sandbox_close` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloseInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
}

/// `sandbox_close` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseOutput {
    /// Always true, closing is idempotent.
    pub ok: bool,
    /// A session was open and is now gone.
    pub closed: bool,
}

/// Encoding of a stored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Raw bytes.
    #[default]
    Text,
    /// Base64 text of the bytes.
    Base64,
}

/// `sandbox_stage_file` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageFileInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Store key, e.g. `files/f_abc123`.
    pub file_key: String,
    /// Destination relative to the workdir.
    pub destination: String,
    /// How the stored object is encoded.
    #[serde(default)]
    pub encoding: Encoding,
}

/// `sandbox_stage_file` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFileOutput {
    /// False when the key is not in the store.
    pub ok: bool,
    /// Destination relative to the workdir.
    pub path: String,
    /// Bytes written.
    pub size_bytes: u64,
    /// Why nothing was staged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `sandbox_publish_file` input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishFileInput {
    /// Sandbox id from `sandbox_open`.
    pub sandbox_id: String,
    /// Source relative to the workdir.
    pub source: String,
    /// Store key; generated when absent.
    #[serde(default)]
    pub file_key: Option<String>,
    /// How to encode the stored object.
    #[serde(default)]
    pub encoding: Encoding,
}

/// `sandbox_publish_file` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishFileOutput {
    /// Always true.
    pub ok: bool,
    /// Key the file is stored under.
    pub file_key: String,
    /// Stored size.
    pub size_bytes: u64,
    /// Inferred MIME type.
    pub content_type: String,
}

fn default_true() -> bool {
    true
}
