//! MCP server functionality for mcsh.
//!
//! The handler owns the engine and the process-global session pool; each
//! `execute_pipeline` request gets its own cancellation scope while the pool
//! is shared across requests for the process lifetime.

pub mod config;
pub mod handler;

pub use config::ServerConfig;
pub use handler::McshServerHandler;
