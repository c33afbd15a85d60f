//! mcsh-engine: the pipeline execution engine behind Model Context Shell.
//!
//! This crate provides:
//!
//! - **Allow-list**: the frozen set of shell commands pipelines may spawn
//! - **Pipe**: bounded inter-stage byte streams with backpressure
//! - **Spawn**: the subprocess runner (arg-vector spawn, timeouts, signals)
//! - **Session pool**: long-lived MCP client sessions to remote tool servers
//! - **Registry**: discovery of tool servers through the surrounding runtime
//! - **Engine**: the orchestrator that validates, composes, and drains a
//!   pipeline, returning a structured result envelope
//!
//! The engine is transport-agnostic: the MCP facade (`mcsh-mcp`) owns the
//! wire format and delegates here.

pub mod allowlist;
pub mod buffers;
pub mod engine;
pub mod pipe;
pub mod pool;
pub mod preview;
pub mod registry;
pub mod session;
pub mod spawn;
pub mod validate;

pub use engine::Engine;
pub use pool::{SessionPool, ToolInvoker};
pub use registry::RegistryClient;
