//! Structural pipeline validation.
//!
//! Runs before any subprocess or tool call. Every failure names the
//! offending stage and field so the agent can fix the pipeline without
//! guessing.

use serde_json::Value;

use mcsh_types::{EngineError, Stage};

use crate::allowlist;

/// Deserialize raw stage values, pointing errors at the failing index.
pub fn parse_stages(values: &[Value]) -> Result<Vec<Stage>, EngineError> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            serde_json::from_value(value.clone())
                .map_err(|e| EngineError::validation(format!("stages[{i}]"), e.to_string()))
        })
        .collect()
}

/// Enforce the stage invariants. Returns the failing stage index (when
/// attributable) alongside the error.
pub fn validate(stages: &[Stage]) -> Result<(), (Option<usize>, EngineError)> {
    if stages.is_empty() {
        return Err((
            None,
            EngineError::validation("stages", "pipeline must contain at least one stage"),
        ));
    }

    for (i, stage) in stages.iter().enumerate() {
        let at = |field: &str| format!("stages[{i}].{field}");
        let fail = |field: &str, message: &str| {
            Err((Some(i), EngineError::validation(at(field), message)))
        };

        if stage.for_each() && i == 0 {
            return fail(
                "for_each",
                "for_each requires an upstream JSON-lines producer",
            );
        }
        if let Some(name) = stage.save_to() {
            if name.is_empty() {
                return fail("save_to", "buffer name must not be empty");
            }
        }

        match stage {
            Stage::Tool(tool) => {
                if tool.name.is_empty() {
                    return fail("name", "tool name must not be empty");
                }
                if tool.server.is_empty() {
                    return fail("server", "server name must not be empty");
                }
            }
            Stage::Command(cmd) => {
                if cmd.command.is_empty() {
                    return fail("command", "command must not be empty");
                }
                if !allowlist::is_allowed(&cmd.command) {
                    return Err((
                        Some(i),
                        EngineError::CommandNotAllowed {
                            command: cmd.command.clone(),
                        },
                    ));
                }
                if let Some(timeout) = cmd.timeout_secs {
                    if !timeout.is_finite() || timeout <= 0.0 {
                        return fail("timeout_secs", "timeout must be positive");
                    }
                }
            }
            Stage::Preview(_) => {
                if i == 0 {
                    return fail("type", "preview requires an upstream stage");
                }
            }
            Stage::ReadBuffers(rb) => {
                if rb.buffers.is_empty() {
                    return fail("buffers", "at least one buffer name is required");
                }
                if rb.buffers.iter().any(|b| b.is_empty()) {
                    return fail("buffers", "buffer names must not be empty");
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stages(values: Vec<Value>) -> Vec<Stage> {
        parse_stages(&values).unwrap()
    }

    #[test]
    fn empty_pipeline_is_rejected() {
        let (stage, err) = validate(&[]).unwrap_err();
        assert!(stage.is_none());
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn disallowed_command_is_rejected_by_kind() {
        let stages = stages(vec![json!({"type":"command","command":"rm","args":["-rf","/"]})]);
        let (stage, err) = validate(&stages).unwrap_err();
        assert_eq!(stage, Some(0));
        assert_eq!(err.kind(), "command_not_allowed");
    }

    #[test]
    fn for_each_on_first_stage_is_rejected() {
        let stages = stages(vec![
            json!({"type":"command","command":"grep","args":["x"],"for_each":true}),
        ]);
        let (stage, err) = validate(&stages).unwrap_err();
        assert_eq!(stage, Some(0));
        assert!(err.to_string().contains("stages[0].for_each"));
    }

    #[test]
    fn preview_needs_an_upstream_stage() {
        let stages = stages(vec![json!({"type":"preview","chars":64})]);
        let (stage, err) = validate(&stages).unwrap_err();
        assert_eq!(stage, Some(0));
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn read_buffers_requires_names() {
        let stages = stages(vec![json!({"type":"read_buffers","buffers":[]})]);
        let (_, err) = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("stages[0].buffers"));
    }

    #[test]
    fn nonpositive_timeout_is_rejected() {
        let stages = stages(vec![
            json!({"type":"command","command":"sort","args":[],"timeout_secs":0.0}),
        ]);
        let (_, err) = validate(&stages).unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[test]
    fn parse_error_names_the_stage_index() {
        let err = parse_stages(&[
            json!({"type":"command","command":"jq","args":["."]}),
            json!({"type":"command","args":["."]}),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("stages[1]"), "{err}");
    }

    #[test]
    fn well_formed_pipeline_passes() {
        let stages = stages(vec![
            json!({"type":"command","command":"jq","args":["."],"save_to":"raw"}),
            json!({"type":"command","command":"grep","args":["x"],"for_each":true}),
            json!({"type":"preview","chars":100}),
            json!({"type":"read_buffers","buffers":["raw"]}),
        ]);
        assert!(validate(&stages).is_ok());
    }
}
