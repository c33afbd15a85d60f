//! mcsh-mcp: MCP server binary for Model Context Shell.
//!
//! Runs the pipeline engine as an MCP server over stdio transport.
//!
//! # Usage
//!
//! ```bash
//! # Point the engine at the tool-server runtime, then run
//! MCSH_REGISTRY_HOST=127.0.0.1 MCSH_REGISTRY_PORT=8080 mcsh-mcp
//! ```
//!
//! Exit codes: 0 on clean shutdown, non-zero on startup failure. Per-pipeline
//! errors are reported in result envelopes and never exit the process.

use anyhow::{Context, Result};
use rmcp::service::ServiceExt;
use rmcp::transport::io::stdio;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcsh_mcp::server::{McshServerHandler, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("mcsh_mcp=info".parse()?)
                .add_directive("mcsh_engine=info".parse()?),
        )
        .init();

    tracing::info!("Starting mcsh MCP server");

    let config = ServerConfig::from_env().context("Failed to load configuration")?;
    match &config.registry {
        Some((host, port)) => tracing::info!(%host, port, "tool runtime configured"),
        None => tracing::warn!("no tool runtime configured; pipelines are command-only"),
    }

    let handler = McshServerHandler::new(config);

    tracing::info!("Serving on stdio");
    let service = handler
        .serve(stdio())
        .await
        .context("Failed to start MCP service")?;

    service.waiting().await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
