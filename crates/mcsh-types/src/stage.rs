//! Pipeline stage descriptions.
//!
//! A pipeline is an ordered list of tagged stages. The tag (`type`) decides
//! which fields are meaningful; unknown tags and unknown fields are rejected
//! during deserialization so that a malformed pipeline never reaches the
//! engine.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default preview budget in characters.
pub const DEFAULT_PREVIEW_CHARS: usize = 3000;

fn default_preview_chars() -> usize {
    DEFAULT_PREVIEW_CHARS
}

/// A complete pipeline: stages plus an optional seed for the first stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipeline {
    /// Stages executed in order.
    pub stages: Vec<Stage>,
    /// Input fed to the first stage (empty when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_input: Option<String>,
}

/// One unit of work in a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Stage {
    /// Call a tool on a remote MCP server.
    Tool(ToolStage),
    /// Run an allow-listed shell command.
    Command(CommandStage),
    /// Summarize upstream data for inspection.
    Preview(PreviewStage),
    /// Emit previously saved buffers as a JSON object.
    ReadBuffers(ReadBuffersStage),
}

impl Stage {
    /// Short label for diagnostics and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Stage::Tool(_) => "tool",
            Stage::Command(_) => "command",
            Stage::Preview(_) => "preview",
            Stage::ReadBuffers(_) => "read_buffers",
        }
    }

    /// The buffer name this stage saves its output to, if any.
    pub fn save_to(&self) -> Option<&str> {
        match self {
            Stage::Tool(t) => t.save_to.as_deref(),
            Stage::Command(c) => c.save_to.as_deref(),
            _ => None,
        }
    }

    /// Whether this stage maps over JSON-lines input.
    pub fn for_each(&self) -> bool {
        match self {
            Stage::Tool(t) => t.for_each,
            Stage::Command(c) => c.for_each,
            _ => false,
        }
    }
}

/// Call an external tool from an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolStage {
    /// Tool name as advertised by the server.
    pub name: String,
    /// Server (workload) name the tool lives on.
    pub server: String,
    /// Static arguments passed to the tool.
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Invoke once per JSON-lines item instead of once for the whole stream.
    #[serde(default)]
    pub for_each: bool,
    /// Capture this stage's full output under the given buffer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<String>,
}

/// Run an allow-listed shell command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandStage {
    /// Command name; must be in the allow-list.
    pub command: String,
    /// Arguments, passed as a distinct vector (never a shell string).
    #[serde(default)]
    pub args: Vec<String>,
    /// Run once per input line instead of once for the whole stream.
    #[serde(default)]
    pub for_each: bool,
    /// Capture this stage's full output under the given buffer name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_to: Option<String>,
    /// Wall-time override for this stage in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<f64>,
}

/// Summarize upstream data within a character budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PreviewStage {
    /// Maximum characters in the summary.
    #[serde(default = "default_preview_chars")]
    pub chars: usize,
}

/// Emit previously saved buffers as a JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReadBuffersStage {
    /// Buffer names to read; unknown names yield `null` plus a warning.
    pub buffers: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_stage_round_trip() {
        let json = r#"{"type":"tool","name":"fetch","server":"web","args":{"url":"http://x"}}"#;
        let stage: Stage = serde_json::from_str(json).unwrap();
        match &stage {
            Stage::Tool(t) => {
                assert_eq!(t.name, "fetch");
                assert_eq!(t.server, "web");
                assert!(!t.for_each);
                assert!(t.save_to.is_none());
            }
            other => panic!("expected tool stage, got {:?}", other),
        }
        assert_eq!(stage.kind(), "tool");
    }

    #[test]
    fn command_stage_defaults() {
        let stage: Stage =
            serde_json::from_str(r#"{"type":"command","command":"jq","args":["."]}"#).unwrap();
        match stage {
            Stage::Command(c) => {
                assert_eq!(c.command, "jq");
                assert_eq!(c.args, vec!["."]);
                assert!(!c.for_each);
                assert!(c.timeout_secs.is_none());
            }
            other => panic!("expected command stage, got {:?}", other),
        }
    }

    #[test]
    fn preview_chars_defaults_to_3000() {
        let stage: Stage = serde_json::from_str(r#"{"type":"preview"}"#).unwrap();
        match stage {
            Stage::Preview(p) => assert_eq!(p.chars, DEFAULT_PREVIEW_CHARS),
            other => panic!("expected preview stage, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let err = serde_json::from_str::<Stage>(r#"{"type":"shell","command":"ls"}"#)
            .unwrap_err()
            .to_string();
        assert!(err.contains("shell"), "error should name the bad tag: {err}");
    }

    #[test]
    fn unknown_field_is_rejected() {
        let result = serde_json::from_str::<Stage>(
            r#"{"type":"command","command":"jq","args":[],"shell":true}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn save_to_accessor_covers_both_kinds() {
        let cmd: Stage = serde_json::from_str(
            r#"{"type":"command","command":"sort","args":[],"save_to":"sorted"}"#,
        )
        .unwrap();
        assert_eq!(cmd.save_to(), Some("sorted"));

        let preview: Stage = serde_json::from_str(r#"{"type":"preview","chars":10}"#).unwrap();
        assert_eq!(preview.save_to(), None);
    }
}
