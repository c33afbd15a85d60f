//! Discovery of remote tool servers through the surrounding runtime.
//!
//! The runtime (a ToolHive-style proxy) enumerates MCP server workloads over
//! a small HTTP API. The engine only needs the workload list: name, proxy
//! URL, transport mode, and status. When no registry is configured, tool
//! stages fail with a clear diagnostic and tool listing returns an empty
//! set.

use std::time::Duration;

use serde::Deserialize;

use mcsh_types::EngineError;

/// Environment variable naming the registry host.
pub const REGISTRY_HOST_ENV: &str = "MCSH_REGISTRY_HOST";
/// Environment variable naming the registry port.
pub const REGISTRY_PORT_ENV: &str = "MCSH_REGISTRY_PORT";

const DEFAULT_PORT: u16 = 8080;
const WORKLOADS_PATH: &str = "/api/v1beta/workloads";
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// One MCP server workload as reported by the runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub transport_type: String,
    #[serde(default)]
    pub proxy_mode: String,
}

impl Workload {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

#[derive(Debug, Deserialize)]
struct WorkloadList {
    #[serde(default)]
    workloads: Vec<Workload>,
}

/// HTTP client for the runtime's workload API.
pub struct RegistryClient {
    host: String,
    base: String,
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            base: format!("http://{host}:{port}"),
            host,
            http: reqwest::Client::new(),
        }
    }

    /// Build a client from `MCSH_REGISTRY_HOST` / `MCSH_REGISTRY_PORT`.
    ///
    /// Returns `None` when no host is configured — the engine then runs in
    /// command-only mode.
    pub fn from_env() -> Option<Self> {
        let host = std::env::var(REGISTRY_HOST_ENV).ok()?;
        if host.is_empty() {
            return None;
        }
        let port = std::env::var(REGISTRY_PORT_ENV)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        Some(Self::new(host, port))
    }

    /// Fetch the current workload list.
    ///
    /// Workload URLs pointing at loopback are rewritten to the registry host
    /// so that the engine can reach sibling containers.
    pub async fn workloads(&self) -> Result<Vec<Workload>, EngineError> {
        let url = format!("{}{}", self.base, WORKLOADS_PATH);
        let response = self
            .http
            .get(&url)
            .timeout(HTTP_TIMEOUT)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| EngineError::ToolTransport {
                server: "registry".to_string(),
                message: format!("workload list failed: {e}"),
            })?;

        let list: WorkloadList =
            response
                .json()
                .await
                .map_err(|e| EngineError::ToolTransport {
                    server: "registry".to_string(),
                    message: format!("workload list was not valid JSON: {e}"),
                })?;

        Ok(list
            .workloads
            .into_iter()
            .map(|w| self.rewrite_loopback(w))
            .collect())
    }

    /// Find one running workload by name.
    pub async fn find(&self, server: &str) -> Result<Workload, EngineError> {
        let workloads = self.workloads().await?;
        let workload = workloads
            .into_iter()
            .find(|w| w.name == server)
            .ok_or_else(|| EngineError::ToolTransport {
                server: server.to_string(),
                message: "no such workload".to_string(),
            })?;
        if !workload.is_running() {
            return Err(EngineError::ToolTransport {
                server: server.to_string(),
                message: format!("workload status is '{}', not running", workload.status),
            });
        }
        Ok(workload)
    }

    fn rewrite_loopback(&self, mut workload: Workload) -> Workload {
        for loopback in ["localhost", "127.0.0.1"] {
            let prefix = format!("http://{loopback}:");
            if let Some(rest) = workload.url.strip_prefix(&prefix) {
                workload.url = format!("http://{}:{rest}", self.host);
                break;
            }
        }
        workload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workload(url: &str) -> Workload {
        Workload {
            name: "web".into(),
            url: url.into(),
            status: "running".into(),
            transport_type: String::new(),
            proxy_mode: "sse".into(),
        }
    }

    #[test]
    fn loopback_urls_are_rewritten_to_the_registry_host() {
        let client = RegistryClient::new("10.0.0.5", 8080);
        let rewritten = client.rewrite_loopback(workload("http://localhost:51234/sse"));
        assert_eq!(rewritten.url, "http://10.0.0.5:51234/sse");

        let rewritten = client.rewrite_loopback(workload("http://127.0.0.1:9000/mcp"));
        assert_eq!(rewritten.url, "http://10.0.0.5:9000/mcp");
    }

    #[test]
    fn external_urls_are_untouched() {
        let client = RegistryClient::new("10.0.0.5", 8080);
        let rewritten = client.rewrite_loopback(workload("http://tools.internal:9000/sse"));
        assert_eq!(rewritten.url, "http://tools.internal:9000/sse");
    }

    #[test]
    fn workload_status_gate() {
        let mut w = workload("http://x/sse");
        assert!(w.is_running());
        w.status = "stopped".into();
        assert!(!w.is_running());
    }
}
