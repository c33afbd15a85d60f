//! A long-lived client session to one remote MCP server.
//!
//! Sessions are owned by the pool and live for the engine process. The
//! transport is chosen from the workload's proxy mode: the runtime proxies
//! servers over SSE or streamable HTTP regardless of their original
//! transport. A broken session is invalidated and reopened on next use.

use rmcp::model::{CallToolRequestParam, CallToolResult, RawContent, Tool as McpTool};
use rmcp::service::{RoleClient, RunningService, ServiceExt};
use rmcp::transport::{SseClientTransport, StreamableHttpClientTransport};
use rmcp::ClientHandler;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use mcsh_types::{EngineError, ToolDescriptor};

use crate::registry::Workload;

/// Client handler that ignores server-initiated traffic; the engine only
/// lists and calls tools.
#[derive(Debug, Clone, Copy, Default)]
struct SilentClientHandler;

impl ClientHandler for SilentClientHandler {}

type ClientService = RunningService<RoleClient, SilentClientHandler>;

/// One live connection to a remote tool server.
pub struct McpSession {
    workload: Workload,
    service: Mutex<Option<ClientService>>,
    tools: Mutex<Option<Vec<McpTool>>>,
}

impl McpSession {
    pub fn new(workload: Workload) -> Self {
        Self {
            workload,
            service: Mutex::new(None),
            tools: Mutex::new(None),
        }
    }

    pub fn server(&self) -> &str {
        &self.workload.name
    }

    fn transport_error(&self, message: impl std::fmt::Display) -> EngineError {
        EngineError::ToolTransport {
            server: self.workload.name.clone(),
            message: message.to_string(),
        }
    }

    /// Open the session if it is not already open.
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        let mut service = self.service.lock().await;
        if service.is_some() {
            return Ok(());
        }

        let url = &self.workload.url;
        if url.is_empty() {
            return Err(self.transport_error("workload has no URL"));
        }

        tracing::debug!(server = %self.workload.name, %url, "opening MCP session");

        let connected = if self.workload.proxy_mode == "sse" {
            let transport = SseClientTransport::start(url.clone())
                .await
                .map_err(|e| self.transport_error(format!("SSE connect failed: {e}")))?;
            SilentClientHandler
                .serve(transport)
                .await
                .map_err(|e| self.transport_error(format!("MCP initialize failed: {e}")))?
        } else if self.workload.proxy_mode == "streamable-http"
            || self.workload.transport_type == "streamable-http"
        {
            let transport = StreamableHttpClientTransport::from_uri(url.clone());
            SilentClientHandler
                .serve(transport)
                .await
                .map_err(|e| self.transport_error(format!("MCP initialize failed: {e}")))?
        } else {
            return Err(self.transport_error(format!(
                "transport '{}' is not supported",
                if self.workload.proxy_mode.is_empty() {
                    &self.workload.transport_type
                } else {
                    &self.workload.proxy_mode
                }
            )));
        };

        *service = Some(connected);
        Ok(())
    }

    /// List the server's tools, cached for the session's lifetime.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>, EngineError> {
        if let Some(tools) = self.tools.lock().await.as_ref() {
            return Ok(tools.clone());
        }

        self.ensure_connected().await?;
        let service = self.service.lock().await;
        let service = service
            .as_ref()
            .ok_or_else(|| self.transport_error("session closed"))?;

        let tools = service
            .list_all_tools()
            .await
            .map_err(|e| self.transport_error(format!("list_tools failed: {e}")))?;

        *self.tools.lock().await = Some(tools.clone());
        Ok(tools)
    }

    /// Call one tool. Transport failures surface as `ToolTransport`; the
    /// caller decides whether to invalidate the session.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, EngineError> {
        self.ensure_connected().await?;
        let service = self.service.lock().await;
        let service = service
            .as_ref()
            .ok_or_else(|| self.transport_error("session closed"))?;

        service
            .call_tool(CallToolRequestParam {
                name: tool.to_string().into(),
                arguments,
            })
            .await
            .map_err(|e| self.transport_error(format!("call_tool failed: {e}")))
    }

    /// Drop the connection and cached tool list so the next use reconnects.
    pub async fn invalidate(&self) {
        if let Some(service) = self.service.lock().await.take() {
            let _ = service.cancel().await;
        }
        *self.tools.lock().await = None;
    }
}

impl std::fmt::Debug for McpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpSession")
            .field("server", &self.workload.name)
            .field("url", &self.workload.url)
            .finish()
    }
}

/// Flatten an MCP tool result into text suitable for the inter-stage stream.
///
/// Text blocks join with newlines; non-text blocks render as bracketed
/// placeholders so the agent can see what was elided.
pub fn flatten_content(result: &CallToolResult) -> String {
    let mut output = String::new();
    for content in &result.content {
        match &content.raw {
            RawContent::Text(text) => {
                if !output.is_empty() {
                    output.push('\n');
                }
                output.push_str(&text.text);
            }
            RawContent::Image(img) => {
                output.push_str(&format!("[image: {}]\n", img.mime_type));
            }
            RawContent::Audio(audio) => {
                output.push_str(&format!("[audio: {}]\n", audio.mime_type));
            }
            RawContent::Resource(res) => {
                let uri = match &res.resource {
                    rmcp::model::ResourceContents::TextResourceContents { uri, .. } => uri,
                    rmcp::model::ResourceContents::BlobResourceContents { uri, .. } => uri,
                };
                output.push_str(&format!("[resource: {uri}]\n"));
            }
            RawContent::ResourceLink(res) => {
                output.push_str(&format!("[resource-link: {}]\n", res.uri));
            }
        }
    }
    output
}

/// Convert an MCP tool definition into the engine's descriptor type.
pub fn describe_tool(tool: &McpTool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name.to_string(),
        description: tool
            .description
            .as_deref()
            .unwrap_or_default()
            .to_string(),
        input_schema: Value::Object((*tool.input_schema).clone()),
    }
}
