//! MCP server handler implementation.
//!
//! Implements `rmcp::ServerHandler` to expose the pipeline engine's four
//! public operations.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{
    CallToolResult, Content, Implementation, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::schemars::{self, JsonSchema};
use rmcp::ErrorData as McpError;
use rmcp::{tool, tool_handler, tool_router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use mcsh_engine::{allowlist, validate, Engine, RegistryClient, SessionPool, ToolInvoker};
use mcsh_types::{Envelope, PipelineStatus};

use super::config::ServerConfig;

/// The mcsh MCP server handler.
#[derive(Clone)]
pub struct McshServerHandler {
    engine: Arc<Engine>,
    pool: Arc<SessionPool>,
    tool_router: ToolRouter<Self>,
}

impl McshServerHandler {
    /// Create a handler with the given configuration. The session pool is
    /// created once here and shared across every request the handler serves.
    pub fn new(config: ServerConfig) -> Self {
        let registry = config
            .registry
            .map(|(host, port)| RegistryClient::new(host, port));
        let pool = Arc::new(SessionPool::new(registry));
        let engine = Arc::new(Engine::with_limits(pool.clone(), config.limits));
        Self {
            engine,
            pool,
            tool_router: Self::tool_router(),
        }
    }
}

/// execute_pipeline input schema.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecutePipelineInput {
    /// Ordered stage objects, each tagged with a `type`.
    #[schemars(
        description = "Ordered pipeline stages. Each stage is an object with a 'type' of \
                       'tool' (name, server, args?, for_each?, save_to?), \
                       'command' (command, args, for_each?, save_to?, timeout_secs?), \
                       'preview' (chars), or 'read_buffers' (buffers)."
    )]
    pub pipeline: Vec<serde_json::Value>,

    /// Input fed to the first stage.
    #[schemars(description = "Initial input fed to the first stage (optional)")]
    pub initial_input: Option<String>,
}

/// get_tool_details input schema.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ToolDetailsInput {
    /// Server (workload) name.
    #[schemars(description = "Tool server name as returned by list_all_tools")]
    pub server: String,

    /// Tool name on that server.
    #[schemars(description = "Tool name")]
    pub tool: String,
}

#[tool_router]
impl McshServerHandler {
    /// Execute a declarative pipeline end to end.
    #[tool(
        description = "Execute a multi-stage data pipeline and return only the final output.\n\n\
                       Stages stream into each other in order: 'tool' calls a remote MCP tool, \
                       'command' runs an allow-listed shell utility (stdin from the previous stage, \
                       stdout to the next), 'preview' summarizes the stream for inspection, and \
                       'read_buffers' emits outputs previously captured with save_to. Set \
                       for_each=true on a tool/command stage to map it over JSON-lines input, \
                       collecting results into a JSON array.\n\n\
                       Use list_available_shell_commands for the command allow-list and \
                       list_all_tools for reachable tool servers."
    )]
    async fn execute_pipeline(
        &self,
        input: Parameters<ExecutePipelineInput>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(
            stages = input.0.pipeline.len(),
            has_input = input.0.initial_input.is_some(),
            "mcp.execute_pipeline"
        );

        let stages = match validate::parse_stages(&input.0.pipeline) {
            Ok(stages) => stages,
            Err(error) => {
                let envelope = Envelope::error(&error, None, Vec::new());
                return envelope_result(envelope);
            }
        };

        // If the client abandons the request, dropping this future cancels
        // every stage task through the guard.
        let cancel = CancellationToken::new();
        let child = cancel.child_token();
        let _guard = cancel.drop_guard();

        let envelope = self
            .engine
            .execute(stages, input.0.initial_input, child)
            .await;
        envelope_result(envelope)
    }

    /// Aggregate tool descriptors across all known tool servers.
    #[tool(
        description = "List every tool on every reachable tool server, grouped by server. \
                       Returns an empty mapping when no tool runtime is configured."
    )]
    async fn list_all_tools(&self) -> Result<CallToolResult, McpError> {
        match self.pool.list_tools().await {
            Ok(map) => {
                let structured =
                    serde_json::to_value(&map).map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult {
                    content: vec![Content::text(structured.to_string())],
                    structured_content: Some(structured),
                    is_error: Some(false),
                    meta: None,
                })
            }
            Err(error) => Ok(error_result(error.kind(), &error.to_string())),
        }
    }

    /// Fetch one tool's descriptor.
    #[tool(description = "Get the name, description, and input schema of one tool.")]
    async fn get_tool_details(
        &self,
        input: Parameters<ToolDetailsInput>,
    ) -> Result<CallToolResult, McpError> {
        match self.pool.describe(&input.0.server, &input.0.tool).await {
            Ok(descriptor) => {
                let structured = serde_json::to_value(&descriptor)
                    .map_err(|e| McpError::internal_error(e.to_string(), None))?;
                Ok(CallToolResult {
                    content: vec![Content::text(structured.to_string())],
                    structured_content: Some(structured),
                    is_error: Some(false),
                    meta: None,
                })
            }
            Err(error) => Ok(error_result(error.kind(), &error.to_string())),
        }
    }

    /// The command allow-list, in declaration order.
    #[tool(description = "List the shell commands pipelines are allowed to run.")]
    async fn list_available_shell_commands(&self) -> Result<CallToolResult, McpError> {
        let commands = allowlist::commands();
        let structured = serde_json::json!(commands);
        Ok(CallToolResult {
            content: vec![Content::text(structured.to_string())],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }
}

/// Render an envelope as a tool result: plain text for the agent, the full
/// envelope as structured content, `is_error` mirroring the status.
fn envelope_result(envelope: Envelope) -> Result<CallToolResult, McpError> {
    let text = match &envelope.status {
        PipelineStatus::Ok => envelope.output.clone(),
        PipelineStatus::Error(info) => format!("{}: {}", info.kind, info.message),
        PipelineStatus::Cancelled => "pipeline cancelled".to_string(),
    };
    let is_error = !envelope.status.is_ok();
    let structured =
        serde_json::to_value(&envelope).map_err(|e| McpError::internal_error(e.to_string(), None))?;

    Ok(CallToolResult {
        content: vec![Content::text(text)],
        structured_content: Some(structured),
        is_error: Some(is_error),
        meta: None,
    })
}

fn error_result(kind: &str, message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(format!("{kind}: {message}"))],
        structured_content: Some(serde_json::json!({ "kind": kind, "message": message })),
        is_error: Some(true),
        meta: None,
    }
}

#[tool_handler]
impl rmcp::ServerHandler for McshServerHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "mcsh — Model Context Shell. Express a multi-stage data workflow as one \
                 declarative pipeline and get back only the final output.\n\n\
                 Tools:\n\
                 • execute_pipeline — run stages (tool calls, allow-listed shell commands, \
                 preview, read_buffers) streamed into each other\n\
                 • list_all_tools — discover tools across connected servers\n\
                 • get_tool_details — inspect one tool's input schema\n\
                 • list_available_shell_commands — the shell command allow-list\n\n\
                 Start with list_all_tools and list_available_shell_commands to learn what a \
                 pipeline can use."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::RawContent;

    fn handler() -> McshServerHandler {
        McshServerHandler::new(ServerConfig::default())
    }

    fn text_of(result: &CallToolResult) -> &str {
        match &result.content[0].raw {
            RawContent::Text(text) => &text.text,
            other => panic!("expected text content, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shell_command_list_is_ordered_and_complete() {
        let result = handler().list_available_shell_commands().await.unwrap();
        assert_eq!(result.is_error, Some(false));

        let commands = result.structured_content.unwrap();
        let commands = commands.as_array().unwrap();
        assert_eq!(commands.len(), 17);
        assert_eq!(commands[0], "jq");
        assert!(commands.iter().any(|c| c == "grep"));
    }

    #[tokio::test]
    async fn execute_pipeline_runs_a_command_stage() {
        let input = Parameters(ExecutePipelineInput {
            pipeline: vec![serde_json::json!({
                "type": "command", "command": "tr", "args": ["a-z", "A-Z"]
            })],
            initial_input: Some("hello\n".into()),
        });
        let result = handler().execute_pipeline(input).await.unwrap();

        assert_eq!(result.is_error, Some(false));
        assert_eq!(text_of(&result), "HELLO\n");

        let structured = result.structured_content.unwrap();
        assert_eq!(structured["status"]["state"], "ok");
        assert_eq!(structured["diagnostics"][0]["kind"], "command");
    }

    #[tokio::test]
    async fn execute_pipeline_rejects_malformed_stages() {
        let input = Parameters(ExecutePipelineInput {
            pipeline: vec![serde_json::json!({"type": "shell", "command": "ls"})],
            initial_input: None,
        });
        let result = handler().execute_pipeline(input).await.unwrap();

        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["status"]["state"], "error");
        assert_eq!(structured["status"]["kind"], "validation_error");
    }

    #[tokio::test]
    async fn execute_pipeline_reports_disallowed_commands() {
        let input = Parameters(ExecutePipelineInput {
            pipeline: vec![serde_json::json!({
                "type": "command", "command": "rm", "args": ["-rf", "/"]
            })],
            initial_input: None,
        });
        let result = handler().execute_pipeline(input).await.unwrap();

        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["status"]["kind"], "command_not_allowed");
    }

    #[tokio::test]
    async fn tool_stage_without_runtime_fails_with_a_clear_diagnostic() {
        let input = Parameters(ExecutePipelineInput {
            pipeline: vec![serde_json::json!({
                "type": "tool", "name": "fetch", "server": "web"
            })],
            initial_input: None,
        });
        let result = handler().execute_pipeline(input).await.unwrap();

        assert_eq!(result.is_error, Some(true));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured["status"]["kind"], "tool_transport_error");
        assert!(structured["status"]["message"]
            .as_str()
            .unwrap()
            .contains("MCSH_REGISTRY_HOST"));
    }

    #[tokio::test]
    async fn list_all_tools_is_empty_without_a_runtime() {
        let result = handler().list_all_tools().await.unwrap();
        assert_eq!(result.is_error, Some(false));
        let structured = result.structured_content.unwrap();
        assert_eq!(structured, serde_json::json!({}));
    }

    #[tokio::test]
    async fn get_info_names_all_four_operations() {
        use rmcp::ServerHandler;

        let info = handler().get_info();
        let instructions = info.instructions.unwrap();
        for op in [
            "execute_pipeline",
            "list_all_tools",
            "get_tool_details",
            "list_available_shell_commands",
        ] {
            assert!(instructions.contains(op), "instructions should mention {op}");
        }
    }
}
