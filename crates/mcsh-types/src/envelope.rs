//! The result envelope returned by every pipeline execution.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Terminal status of a pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PipelineStatus {
    /// All stages completed.
    Ok,
    /// A stage failed; `ErrorInfo` names the kind and the stage.
    Error(ErrorInfo),
    /// The caller cancelled the pipeline before it completed.
    Cancelled,
}

impl PipelineStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, PipelineStatus::Ok)
    }
}

/// Machine-readable description of a pipeline failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error kind name (see `EngineError::kind`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Zero-based index of the failing stage, when attributable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<usize>,
}

impl ErrorInfo {
    pub fn from_error(err: &EngineError, stage: Option<usize>) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            stage,
        }
    }
}

/// Per-stage execution record attached to the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostic {
    /// Zero-based stage index.
    pub stage: usize,
    /// Stage kind label (`tool`, `command`, `preview`, `read_buffers`).
    pub kind: String,
    /// Wall time spent in the stage.
    pub elapsed_ms: u64,
    /// Bytes the stage produced on its output stream.
    pub bytes_out: u64,
    /// Non-fatal conditions (truncation, stderr noise, unknown buffers).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// Structured return value of an end-to-end pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Final output of the terminal stage (empty on error/cancel).
    pub output: String,
    /// One record per stage that ran, in pipeline order.
    pub diagnostics: Vec<StageDiagnostic>,
    /// Terminal status.
    pub status: PipelineStatus,
}

impl Envelope {
    /// An error envelope carrying whatever diagnostics were gathered.
    pub fn error(err: &EngineError, stage: Option<usize>, diagnostics: Vec<StageDiagnostic>) -> Self {
        Self {
            output: String::new(),
            diagnostics,
            status: PipelineStatus::Error(ErrorInfo::from_error(err, stage)),
        }
    }

    /// A cancelled envelope.
    pub fn cancelled(diagnostics: Vec<StageDiagnostic>) -> Self {
        Self {
            output: String::new(),
            diagnostics,
            status: PipelineStatus::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_state_tag() {
        let ok = serde_json::to_value(PipelineStatus::Ok).unwrap();
        assert_eq!(ok["state"], "ok");

        let err = PipelineStatus::Error(ErrorInfo {
            kind: "command_not_allowed".into(),
            message: "command 'rm' is not allowed".into(),
            stage: Some(0),
        });
        let json = serde_json::to_value(err).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["kind"], "command_not_allowed");
        assert_eq!(json["stage"], 0);
    }

    #[test]
    fn error_envelope_has_empty_output() {
        let err = EngineError::Cancelled;
        let envelope = Envelope::error(&err, None, Vec::new());
        assert!(envelope.output.is_empty());
        assert!(!envelope.status.is_ok());
    }
}
