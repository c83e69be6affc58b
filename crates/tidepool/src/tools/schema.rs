//! Tool names and JSON Schemas advertised to models.

use serde_json::{Value, json};

use super::ToolDefinition;

/// Open or reuse the sandbox of the current run.
pub const TOOL_OPEN: &str = "sandbox_open";
/// Run a command.
pub const TOOL_EXEC: &str = "sandbox_exec";
/// Write a file.
pub const TOOL_FS_WRITE: &str = "sandbox_fs_write";
/// Read a file.
pub const TOOL_FS_READ: &str = "sandbox_fs_read";
/// List a directory.
pub const TOOL_FS_LIST: &str = "sandbox_fs_list";
/// Delete a file or directory.
pub const TOOL_FS_DELETE: &str = "sandbox_fs_delete";
/// Destroy the sandbox.
pub const TOOL_CLOSE: &str = "sandbox_close";
/// Copy a stored file into the sandbox.
pub const TOOL_STAGE_FILE: &str = "sandbox_stage_file";
/// Copy a sandbox file into the store.
pub const TOOL_PUBLISH_FILE: &str = "sandbox_publish_file";

/// Longest accepted `timeout_seconds`.
pub const MAX_TIMEOUT_SECS: u64 = 3600;
/// Default `max_bytes` of `sandbox_fs_read`.
pub const DEFAULT_READ_BYTES: u64 = 256 * 1024;

fn sandbox_id() -> Value {
    json!({
        "type": "string",
        "description": "Sandbox id returned by sandbox_open"
    })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}

/// Definitions of the core tools.
///
/// `default_timeout_secs` is the exec deadline used when a call omits one.
pub(crate) fn core_definitions(default_timeout_secs: u64) -> Vec<ToolDefinition> {
    vec![
        ToolDefinition::new(
            TOOL_OPEN,
            "Open the persistent sandbox for this run, creating it on first use. \
             Files written in the sandbox stay there across tool calls.",
            object(
                json!({
                    "session_key": {
                        "type": "string",
                        "description": "Optional session name. Different names get different sandboxes."
                    }
                }),
                &[],
            ),
        ),
        ToolDefinition::new(
            TOOL_EXEC,
            "Run a command in the sandbox. Returns exit code, stdout and stderr. \
             A non-zero exit or a timeout is reported in the result, not as an error.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "cmd": {
                        "type": ["array", "string"],
                        "items": { "type": "string" },
                        "description": "Program and arguments, or a shell command line"
                    },
                    "cwd": {
                        "type": "string",
                        "description": "Working directory, relative to the sandbox workdir"
                    },
                    "env": {
                        "type": "object",
                        "additionalProperties": { "type": "string" },
                        "description": "Extra environment variables"
                    },
                    "timeout_seconds": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": MAX_TIMEOUT_SECS,
                        "default": default_timeout_secs,
                        "description": "Deadline for this command"
                    }
                }),
                &["sandbox_id", "cmd"],
            ),
        ),
        ToolDefinition::new(
            TOOL_FS_WRITE,
            "Write a file in the sandbox, creating parent directories. \
             Use contents for text and contents_b64 for binary data.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "path": {
                        "type": "string",
                        "description": "Destination, relative to the sandbox workdir"
                    },
                    "contents": { "type": "string", "description": "Text contents" },
                    "contents_b64": { "type": "string", "description": "Base64 contents" },
                    "mode": {
                        "type": "string",
                        "default": "0644",
                        "description": "Octal permissions"
                    },
                    "overwrite": {
                        "type": "boolean",
                        "default": true,
                        "description": "Replace an existing file"
                    }
                }),
                &["sandbox_id", "path"],
            ),
        ),
        ToolDefinition::new(
            TOOL_FS_READ,
            "Read a file from the sandbox. Text comes back as contents, \
             anything else as contents_b64.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "path": { "type": "string", "description": "File to read" },
                    "max_bytes": {
                        "type": "integer",
                        "minimum": 1,
                        "default": DEFAULT_READ_BYTES,
                        "description": "Read at most this many bytes"
                    }
                }),
                &["sandbox_id", "path"],
            ),
        ),
        ToolDefinition::new(
            TOOL_FS_LIST,
            "List a directory in the sandbox.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "path": {
                        "type": "string",
                        "description": "Directory, the sandbox workdir by default"
                    },
                    "recursive": { "type": "boolean", "description": "Include subdirectories" }
                }),
                &["sandbox_id"],
            ),
        ),
        ToolDefinition::new(
            TOOL_FS_DELETE,
            "Delete a file, or a directory when recursive is set.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "path": { "type": "string", "description": "Path to delete" },
                    "recursive": { "type": "boolean", "description": "Delete a directory and its contents" }
                }),
                &["sandbox_id", "path"],
            ),
        ),
        ToolDefinition::new(
            TOOL_CLOSE,
            "Destroy the sandbox and everything in it. Closing twice is fine.",
            object(json!({ "sandbox_id": sandbox_id() }), &["sandbox_id"]),
        ),
    ]
}

/// Definitions of the file store tools.
pub(crate) fn store_definitions() -> Vec<ToolDefinition> {
    let encoding = json!({
        "type": "string",
        "enum": ["text", "base64"],
        "description": "base64 when the stored object is base64 text, default text"
    });
    vec![
        ToolDefinition::new(
            TOOL_STAGE_FILE,
            "Copy an uploaded file into the sandbox.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "file_key": {
                        "type": "string",
                        "description": "Key of the stored file, e.g. files/f_abc123"
                    },
                    "destination": {
                        "type": "string",
                        "description": "Destination, relative to the sandbox workdir"
                    },
                    "encoding": encoding.clone()
                }),
                &["sandbox_id", "file_key", "destination"],
            ),
        ),
        ToolDefinition::new(
            TOOL_PUBLISH_FILE,
            "Copy a file out of the sandbox so it can be shared. Returns its file key.",
            object(
                json!({
                    "sandbox_id": sandbox_id(),
                    "source": {
                        "type": "string",
                        "description": "File to publish, relative to the sandbox workdir"
                    },
                    "file_key": {
                        "type": "string",
                        "description": "Key to store under, generated when omitted"
                    },
                    "encoding": encoding
                }),
                &["sandbox_id", "source"],
            ),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_fields() {
        let exec = core_definitions(60)
            .into_iter()
            .find(|d| d.name == TOOL_EXEC)
            .map(|d| d.parameters);
        assert_eq!(
            exec.as_ref().map(|p| p["required"].clone()),
            Some(json!(["sandbox_id", "cmd"]))
        );
    }

    #[test]
    fn test_every_schema_is_closed() {
        for definition in core_definitions(60).into_iter().chain(store_definitions()) {
            assert_eq!(definition.parameters["type"], "object", "{}", definition.name);
            assert_eq!(
                definition.parameters["additionalProperties"], false,
                "{}",
                definition.name
            );
            assert!(definition.name.starts_with("sandbox_"));
        }
    }

    #[test]
    fn test_defaults_are_advertised() {
        let definitions = core_definitions(90);
        let parameters = |name: &str| {
            definitions
                .iter()
                .find(|d| d.name == name)
                .map(|d| d.parameters.clone())
                .unwrap_or_default()
        };

        let exec = parameters(TOOL_EXEC);
        assert_eq!(exec["properties"]["timeout_seconds"]["default"], 90);
        let read = parameters(TOOL_FS_READ);
        assert_eq!(read["properties"]["max_bytes"]["default"], DEFAULT_READ_BYTES);
        let write = parameters(TOOL_FS_WRITE);
        assert_eq!(write["properties"]["overwrite"]["default"], true);
    }
}
