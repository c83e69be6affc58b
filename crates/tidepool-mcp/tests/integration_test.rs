//! Integration tests for the Tidepool MCP server.
//!
//! These tests spawn the actual server binary with the in-memory backend and
//! talk to it over stdio using JSON-RPC.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;

/// Helper to spawn the MCP server process
struct McpServerProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl McpServerProcess {
    fn spawn() -> Self {
        Self::spawn_with_args(&[])
    }

    fn spawn_with_args(args: &[&str]) -> Self {
        let binary = env!("CARGO_BIN_EXE_tidepool-mcp");
        let mut child = Command::new(binary)
            .args(["--backend", "memory", "--cleanup-interval-secs", "0"])
            .args(args)
            .env_remove("TIDEPOOL_CONFIG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("Failed to spawn MCP server at {binary:?}: {e}"));
        let stdout = BufReader::new(child.stdout.take().expect("stdout not captured"));
        Self { child, stdout }
    }

    /// Send a JSON-RPC request and get the response
    fn request(&mut self, request: Value) -> Value {
        self.notify(request);
        let mut response_line = String::new();
        self.stdout
            .read_line(&mut response_line)
            .expect("read response");
        serde_json::from_str(&response_line)
            .unwrap_or_else(|e| panic!("parse response '{}': {}", response_line.trim(), e))
    }

    /// Send a notification (no response expected)
    fn notify(&mut self, message: Value) {
        let stdin = self.child.stdin.as_mut().expect("stdin not captured");
        let line = serde_json::to_string(&message).expect("serialize message");
        writeln!(stdin, "{line}").expect("write message");
        stdin.flush().expect("flush stdin");
    }

    /// Call a tool and return the JSON-RPC response.
    fn call_tool(&mut self, id: u64, name: &str, arguments: Value) -> Value {
        self.request(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments }
        }))
    }
}

impl Drop for McpServerProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Perform MCP initialization handshake
fn initialize(server: &mut McpServerProcess) -> Value {
    let init_response = server.request(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "tidepool-mcp-test",
                "version": "0.1.0"
            }
        }
    }));

    assert_eq!(init_response["jsonrpc"], "2.0");
    assert_eq!(init_response["id"], 1);
    assert!(
        init_response.get("result").is_some(),
        "Expected result in initialize response, got: {init_response}"
    );

    server.notify(json!({
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    }));

    // Give the server a moment to process
    std::thread::sleep(Duration::from_millis(50));

    init_response
}

/// Parse the JSON payload of a successful tool result.
fn payload(response: &Value) -> Value {
    let result = &response["result"];
    assert_ne!(
        result["isError"], true,
        "Expected successful tool call, got: {response}"
    );
    let text = result["content"][0]["text"].as_str().expect("text content");
    serde_json::from_str(text).expect("tool result is JSON")
}

fn tool_names(server: &mut McpServerProcess) -> Vec<String> {
    let response = server.request(json!({
        "jsonrpc": "2.0",
        "id": 2,
        "method": "tools/list",
        "params": {}
    }));
    response["result"]["tools"]
        .as_array()
        .expect("tools should be an array")
        .iter()
        .filter_map(|t| t["name"].as_str().map(str::to_string))
        .collect()
}

#[test]
fn test_mcp_initialize() {
    let mut server = McpServerProcess::spawn();
    let response = initialize(&mut server);

    let result = &response["result"];
    assert!(result.get("serverInfo").is_some(), "Expected serverInfo");
    assert!(
        result["capabilities"].get("tools").is_some(),
        "Expected tools capability"
    );
}

#[test]
fn test_mcp_list_tools() {
    let mut server = McpServerProcess::spawn();
    initialize(&mut server);

    let names = tool_names(&mut server);
    assert_eq!(
        names,
        vec![
            "sandbox_open",
            "sandbox_exec",
            "sandbox_fs_write",
            "sandbox_fs_read",
            "sandbox_fs_list",
            "sandbox_fs_delete",
            "sandbox_close"
        ]
    );
}

#[test]
fn test_mcp_file_tools_need_a_store() {
    let store = TempDir::new().expect("tempdir");
    let path = store.path().to_str().expect("utf-8 path");
    let mut server = McpServerProcess::spawn_with_args(&["--file-store", path]);
    initialize(&mut server);

    let names = tool_names(&mut server);
    assert!(names.iter().any(|n| n == "sandbox_stage_file"));
    assert!(names.iter().any(|n| n == "sandbox_publish_file"));
}

#[test]
fn test_mcp_files_persist_between_calls() {
    let mut server = McpServerProcess::spawn();
    initialize(&mut server);

    let opened = payload(&server.call_tool(3, "sandbox_open", json!({})));
    assert_eq!(opened["created"], true);
    assert_eq!(opened["workdir"], "/work");
    let sandbox_id = opened["sandbox_id"].clone();

    let written = payload(&server.call_tool(
        4,
        "sandbox_fs_write",
        json!({"sandbox_id": sandbox_id, "path": "notes.txt", "contents": "hello world"}),
    ));
    assert_eq!(written["ok"], true);

    let again = payload(&server.call_tool(5, "sandbox_open", json!({})));
    assert_eq!(again["created"], false);
    assert_eq!(again["sandbox_id"], sandbox_id);

    let output = payload(&server.call_tool(
        6,
        "sandbox_exec",
        json!({"sandbox_id": sandbox_id, "cmd": ["cat", "notes.txt"]}),
    ));
    assert_eq!(output["exit_code"], 0);
    assert_eq!(output["stdout"], "hello world");
}

#[test]
fn test_mcp_exit_code_is_a_result() {
    let mut server = McpServerProcess::spawn();
    initialize(&mut server);

    let opened = payload(&server.call_tool(3, "sandbox_open", json!({})));
    let output = payload(&server.call_tool(
        4,
        "sandbox_exec",
        json!({"sandbox_id": opened["sandbox_id"], "cmd": "false"}),
    ));
    assert_eq!(output["exit_code"], 1);
}

#[test]
fn test_mcp_invalid_arguments() {
    let mut server = McpServerProcess::spawn();
    initialize(&mut server);

    let response = server.call_tool(3, "sandbox_exec", json!({"cmd": ["ls"]}));
    assert!(
        response.get("error").is_some(),
        "Expected a JSON-RPC error, got: {response}"
    );
}

#[test]
fn test_mcp_unknown_sandbox_is_reported_in_band() {
    let mut server = McpServerProcess::spawn();
    initialize(&mut server);

    let response = server.call_tool(
        3,
        "sandbox_exec",
        json!({"sandbox_id": "sbx_nope", "cmd": ["true"]}),
    );
    assert_eq!(response["result"]["isError"], true, "got: {response}");
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .expect("text content");
    assert!(text.contains("session not found"), "got: {text}");
}
