//! mcsh-mcp: the MCP server facade for the mcsh pipeline engine.
//!
//! Exposes four operations to agents over stdio:
//!
//! - **execute_pipeline** — run a declarative pipeline end to end
//! - **list_all_tools** — aggregate tool descriptors across tool servers
//! - **get_tool_details** — one tool's descriptor
//! - **list_available_shell_commands** — the command allow-list

pub mod server;
