//! Typed error kinds for pipeline execution.
//!
//! The engine reasons about error *kinds*, never message text. Every variant
//! maps to a stable machine-readable name via [`EngineError::kind`], which is
//! what the result envelope carries back to the agent.

use thiserror::Error;

/// Errors raised while validating or executing a pipeline.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The pipeline description is structurally invalid. `path` points at the
    /// offending stage and field (e.g. `stages[2].for_each`).
    #[error("invalid pipeline at {path}: {message}")]
    Validation { path: String, message: String },

    /// The named command is not in the allow-list.
    #[error("command '{command}' is not allowed")]
    CommandNotAllowed { command: String },

    /// A subprocess exited unsuccessfully (or timed out).
    #[error("command '{command}' failed with exit code {exit_code}: {stderr_tail}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr_tail: String,
    },

    /// The remote tool reported an error result.
    #[error("tool {server}/{tool} failed: {message}")]
    ToolInvocation {
        server: String,
        tool: String,
        message: String,
    },

    /// The session to the remote server broke; it will be reopened on next use.
    #[error("transport error for server '{server}': {message}")]
    ToolTransport { server: String, message: String },

    /// The requested tool does not exist on the server.
    #[error("tool '{tool}' not found on server '{server}'")]
    ToolNotFound { server: String, tool: String },

    /// Captured buffer bytes exceeded the per-invocation bound.
    #[error("buffer capture exceeded the limit of {limit} bytes")]
    BufferLimitExceeded { limit: u64 },

    /// A for_each stage fanned out over more items than permitted.
    #[error("for_each input exceeded the limit of {limit} items")]
    ForEachLimitExceeded { limit: u64 },

    /// The pipeline was cancelled by the caller.
    #[error("pipeline cancelled")]
    Cancelled,

    /// Unexpected engine-internal failure (pipe plumbing, task join).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl EngineError {
    /// Stable machine-readable name for this error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation { .. } => "validation_error",
            EngineError::CommandNotAllowed { .. } => "command_not_allowed",
            EngineError::CommandFailed { .. } => "command_failed",
            EngineError::ToolInvocation { .. } => "tool_invocation_error",
            EngineError::ToolTransport { .. } => "tool_transport_error",
            EngineError::ToolNotFound { .. } => "tool_not_found",
            EngineError::BufferLimitExceeded { .. } => "buffer_limit_exceeded",
            EngineError::ForEachLimitExceeded { .. } => "for_each_limit_exceeded",
            EngineError::Cancelled => "cancelled",
            EngineError::Internal { .. } => "internal_error",
        }
    }

    /// Shorthand for an internal error from any displayable cause.
    pub fn internal(message: impl std::fmt::Display) -> Self {
        EngineError::Internal {
            message: message.to_string(),
        }
    }

    /// Shorthand for a validation error at a given path.
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            EngineError::CommandNotAllowed {
                command: "rm".into()
            }
            .kind(),
            "command_not_allowed"
        );
        assert_eq!(EngineError::Cancelled.kind(), "cancelled");
        assert_eq!(
            EngineError::validation("stages[0]", "bad").kind(),
            "validation_error"
        );
    }

    #[test]
    fn display_names_the_command() {
        let err = EngineError::CommandFailed {
            command: "jq".into(),
            exit_code: 2,
            stderr_tail: "parse error".into(),
        };
        let text = err.to_string();
        assert!(text.contains("jq"));
        assert!(text.contains("2"));
        assert!(text.contains("parse error"));
    }
}
