//! The tool-server session pool.
//!
//! One lazily-opened session per server name, shared across pipelines for
//! the engine process's lifetime. Concurrent invocations against the same
//! server serialize on that session; the pool never opens duplicate
//! sessions. A transport failure evicts the session so the next use reopens
//! it — the failing invocation is reported, never silently retried.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use mcsh_types::{EngineError, ToolDescriptor};

use crate::registry::RegistryClient;
use crate::session::{describe_tool, flatten_content, McpSession};

/// The facade's own operations. A workload advertising all of them is this
/// orchestrator seen through the runtime; it is filtered out of discovery to
/// avoid self-reference.
const ORCHESTRATOR_TOOLS: [&str; 4] = [
    "execute_pipeline",
    "list_all_tools",
    "get_tool_details",
    "list_available_shell_commands",
];

/// Seam between stage executors and the remote-tool machinery, so tests can
/// substitute a fake.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke a tool and return its flattened textual result.
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError>;

    /// Fetch one tool's descriptor.
    async fn describe(&self, server: &str, tool: &str) -> Result<ToolDescriptor, EngineError>;
}

/// Process-global registry of live tool-server sessions.
pub struct SessionPool {
    registry: Option<RegistryClient>,
    sessions: Mutex<HashMap<String, Arc<McpSession>>>,
}

impl SessionPool {
    pub fn new(registry: Option<RegistryClient>) -> Self {
        Self {
            registry,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Pool configured from the environment; without a registry pointer the
    /// pool runs in command-only mode.
    pub fn from_env() -> Self {
        Self::new(RegistryClient::from_env())
    }

    pub fn has_registry(&self) -> bool {
        self.registry.is_some()
    }

    fn registry(&self, server: &str) -> Result<&RegistryClient, EngineError> {
        self.registry.as_ref().ok_or_else(|| EngineError::ToolTransport {
            server: server.to_string(),
            message: format!(
                "no tool runtime configured (set {} to enable tool stages)",
                crate::registry::REGISTRY_HOST_ENV
            ),
        })
    }

    /// Get or lazily open the session for a server.
    async fn session(&self, server: &str) -> Result<Arc<McpSession>, EngineError> {
        {
            let sessions = self.sessions.lock().await;
            if let Some(session) = sessions.get(server) {
                return Ok(session.clone());
            }
        }

        let workload = self.registry(server)?.find(server).await?;
        let session = Arc::new(McpSession::new(workload));

        let mut sessions = self.sessions.lock().await;
        // Another caller may have raced us here; keep the first session so
        // the one-session-per-server rule holds.
        Ok(sessions
            .entry(server.to_string())
            .or_insert(session)
            .clone())
    }

    async fn evict(&self, server: &str) {
        let session = self.sessions.lock().await.remove(server);
        if let Some(session) = session {
            tracing::warn!(server, "evicting broken tool session");
            session.invalidate().await;
        }
    }

    /// Aggregate tool descriptors across all running workloads.
    ///
    /// Servers that fail to answer are skipped with a warning; an empty map
    /// is returned when no registry is configured.
    pub async fn list_tools(&self) -> Result<BTreeMap<String, Vec<ToolDescriptor>>, EngineError> {
        let registry = match &self.registry {
            Some(registry) => registry,
            None => return Ok(BTreeMap::new()),
        };

        let workloads = registry.workloads().await?;
        let running: Vec<_> = workloads.into_iter().filter(|w| w.is_running()).collect();

        let listings = futures::future::join_all(running.iter().map(|workload| async {
            let session = self.session(&workload.name).await?;
            let tools = session.list_tools().await;
            if tools.is_err() {
                self.evict(&workload.name).await;
            }
            tools.map(|t| (workload.name.clone(), t))
        }))
        .await;

        let mut map = BTreeMap::new();
        for listing in listings {
            match listing {
                Ok((server, tools)) => {
                    let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
                    if ORCHESTRATOR_TOOLS.iter().all(|op| names.contains(op)) {
                        tracing::debug!(server, "skipping orchestrator workload (self)");
                        continue;
                    }
                    map.insert(server, tools.iter().map(describe_tool).collect());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreachable tool server");
                }
            }
        }
        Ok(map)
    }
}

#[async_trait]
impl ToolInvoker for SessionPool {
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let session = self.session(server).await?;
        let arguments = if args.is_empty() { None } else { Some(args) };

        let result = tokio::select! {
            result = session.call_tool(tool, arguments) => result,
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                if matches!(e, EngineError::ToolTransport { .. }) {
                    self.evict(server).await;
                }
                return Err(e);
            }
        };

        let text = flatten_content(&result);
        if result.is_error.unwrap_or(false) {
            return Err(EngineError::ToolInvocation {
                server: server.to_string(),
                tool: tool.to_string(),
                message: text,
            });
        }
        Ok(text)
    }

    async fn describe(&self, server: &str, tool: &str) -> Result<ToolDescriptor, EngineError> {
        let session = self.session(server).await?;
        let tools = match session.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                self.evict(server).await;
                return Err(e);
            }
        };

        tools
            .iter()
            .find(|t| t.name == tool)
            .map(describe_tool)
            .ok_or_else(|| EngineError::ToolNotFound {
                server: server.to_string(),
                tool: tool.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_registry_means_empty_tool_map() {
        let pool = SessionPool::new(None);
        let tools = pool.list_tools().await.unwrap();
        assert!(tools.is_empty());
    }

    #[tokio::test]
    async fn invoke_without_registry_names_the_env_var() {
        let pool = SessionPool::new(None);
        let cancel = CancellationToken::new();
        let err = pool
            .invoke("web", "fetch", Map::new(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "tool_transport_error");
        assert!(err.to_string().contains("MCSH_REGISTRY_HOST"));
    }
}
