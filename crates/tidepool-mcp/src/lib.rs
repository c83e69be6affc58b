//! Tidepool MCP Server
//!
//! An MCP server that exposes persistent sandboxes as `sandbox_*` tools.
//! One server process acts for one agent run: every tool call shares the
//! server's [`ExecutionContext`], so files survive from call to call.

use std::future::Future;
use std::sync::Arc;

use rmcp::{
    ErrorData as McpError, ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
};
use tidepool::{ExecutionContext, SandboxToolkit, SessionManager, ToolDefinition};

/// MCP server backed by a [`SandboxToolkit`].
#[derive(Clone)]
pub struct TidepoolServer {
    toolkit: Arc<SandboxToolkit>,
    context: ExecutionContext,
}

impl std::fmt::Debug for TidepoolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TidepoolServer")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl TidepoolServer {
    /// Serve `toolkit` on behalf of the run described by `context`.
    pub fn new(toolkit: Arc<SandboxToolkit>, context: ExecutionContext) -> Self {
        Self { toolkit, context }
    }

    /// The toolkit, for shutdown.
    pub fn toolkit(&self) -> &Arc<SandboxToolkit> {
        &self.toolkit
    }

    /// Run one tool call and render the result for the model.
    ///
    /// Bad arguments are protocol errors. Everything else that fails is
    /// reported in-band so the model can read it and react.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = serde_json::Value::Object(arguments.unwrap_or_default());
        match self.toolkit.call(name, arguments, &self.context).await {
            Ok(value) => {
                let text = serde_json::to_string_pretty(&value)
                    .map_err(|e| McpError::internal_error(format!("encoding result: {e}"), None))?;
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) if e.is_validation() => Err(McpError::invalid_params(e.to_string(), None)),
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "tool call failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

/// Drive `service` to the end, then destroy every sandbox `manager` owns.
///
/// Sandboxes are closed whether the service finished cleanly or failed; the
/// service outcome is returned afterwards.
pub async fn run_then_close<F, E>(manager: &SessionManager, service: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
{
    let outcome = service.await;
    tracing::info!("Tidepool MCP server shutting down");
    match manager.close().await {
        Ok(count) => tracing::info!(count, "sandboxes destroyed"),
        Err(e) => tracing::warn!(error = %e, "some sandboxes could not be destroyed"),
    }
    outcome
}

fn to_tool(definition: ToolDefinition) -> Tool {
    let input_schema = match definition.parameters {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    };
    Tool {
        name: definition.name.into(),
        title: None,
        description: Some(definition.description.into()),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
        meta: None,
    }
}

impl ServerHandler for TidepoolServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Tidepool gives you a persistent Linux container. Call sandbox_open first and \
                pass the returned sandbox_id to the other tools. Files you write stay in the \
                sandbox until you call sandbox_close, so you can build up work across calls. \
                Relative paths resolve against the sandbox workdir."
                    .into(),
            ),
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: self.toolkit.definitions().into_iter().map(to_tool).collect(),
            next_cursor: None,
            meta: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.dispatch(request.name.as_ref(), request.arguments).await
    }
}
