//! The for-each driver: per-item mapped execution over JSON-lines input.
//!
//! Items run sequentially in input order and aggregate into one JSON array,
//! one element per non-empty line. A bad item (unparseable line, failed
//! invocation) becomes an in-place error marker instead of failing the
//! stage; transport breakage and cancellation still abort the whole stage.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use mcsh_types::{CommandStage, EngineError, ToolStage};

use crate::pipe::PipeReader;
use crate::spawn;

use super::stage::StageOutput;
use super::StageContext;

/// Map a tool invocation over each JSON-lines item.
pub(crate) async fn run_tool(
    spec: ToolStage,
    upstream: PipeReader,
    output: &mut StageOutput,
    ctx: &StageContext,
) -> Result<Vec<String>, EngineError> {
    let mut lines = BufReader::new(upstream).split(b'\n');
    let mut results: Vec<Value> = Vec::new();
    let mut failed = 0usize;
    let mut line_num = 0usize;

    while let Some(segment) = next_segment(&mut lines, &ctx.cancel).await? {
        line_num += 1;
        let text = String::from_utf8_lossy(&segment);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        check_fan_out(results.len(), ctx)?;

        let fields = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(fields)) => fields,
            Ok(other) => {
                failed += 1;
                results.push(error_marker(
                    line_num,
                    "validation_error",
                    &format!("expected a JSON object, got {}", json_type(&other)),
                ));
                continue;
            }
            Err(e) => {
                failed += 1;
                results.push(error_marker(
                    line_num,
                    "validation_error",
                    &format!("invalid JSON: {e}"),
                ));
                continue;
            }
        };

        // Parsed item fields take precedence over the stage's static args.
        let mut args = spec.args.clone();
        for (key, value) in fields {
            args.insert(key, value);
        }

        let invocation = ctx
            .invoker
            .invoke(&spec.server, &spec.name, args, &ctx.cancel);
        match tokio::time::timeout(ctx.limits.tool_timeout, invocation).await {
            Ok(Ok(text)) => results.push(parse_item(&text)),
            Ok(Err(EngineError::ToolInvocation { message, .. })) => {
                failed += 1;
                results.push(error_marker(line_num, "tool_invocation_error", &message));
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                failed += 1;
                results.push(error_marker(
                    line_num,
                    "tool_invocation_error",
                    &format!("timed out after {}s", ctx.limits.tool_timeout.as_secs_f64()),
                ));
            }
        }
    }

    let total = results.len();
    emit(results, output).await?;

    let mut warnings = Vec::new();
    if failed > 0 {
        warnings.push(format!(
            "{failed} of {total} items produced error markers"
        ));
    }
    Ok(warnings)
}

/// Run a subprocess once per input line, feeding the line on stdin.
pub(crate) async fn run_command(
    spec: CommandStage,
    upstream: PipeReader,
    output: &mut StageOutput,
    ctx: &StageContext,
) -> Result<Vec<String>, EngineError> {
    let timeout = spec
        .timeout_secs
        .map(Duration::from_secs_f64)
        .unwrap_or(ctx.limits.command_timeout);

    let mut lines = BufReader::new(upstream).split(b'\n');
    let mut results: Vec<Value> = Vec::new();
    let mut warnings = Vec::new();
    let mut failed = 0usize;
    let mut line_num = 0usize;

    while let Some(segment) = next_segment(&mut lines, &ctx.cancel).await? {
        line_num += 1;
        let text = String::from_utf8_lossy(&segment);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }
        check_fan_out(results.len(), ctx)?;

        let mut stdin = line.to_string();
        stdin.push('\n');
        match spawn::run_once(&spec.command, &spec.args, stdin.as_bytes(), timeout, &ctx.cancel)
            .await
        {
            Ok(item) => {
                if item.is_failure() {
                    failed += 1;
                    results.push(error_marker(
                        line_num,
                        "command_failed",
                        &format!("exit code {}: {}", item.exit_code, item.stderr_tail),
                    ));
                } else {
                    if !item.stderr_tail.is_empty() {
                        warnings.push(format!("line {line_num}: stderr: {}", item.stderr_tail));
                    }
                    results.push(parse_item(&String::from_utf8_lossy(&item.stdout)));
                }
            }
            Err(EngineError::CommandFailed {
                exit_code,
                stderr_tail,
                ..
            }) => {
                failed += 1;
                results.push(error_marker(
                    line_num,
                    "command_failed",
                    &format!("exit code {exit_code}: {stderr_tail}"),
                ));
            }
            Err(e) => return Err(e),
        }
    }

    let total = results.len();
    emit(results, output).await?;

    if failed > 0 {
        warnings.push(format!(
            "{failed} of {total} items produced error markers"
        ));
    }
    Ok(warnings)
}

async fn next_segment(
    lines: &mut tokio::io::Split<BufReader<PipeReader>>,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, EngineError> {
    tokio::select! {
        segment = lines.next_segment() => segment.map_err(EngineError::internal),
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

fn check_fan_out(processed: usize, ctx: &StageContext) -> Result<(), EngineError> {
    if processed >= ctx.limits.max_for_each_items {
        return Err(EngineError::ForEachLimitExceeded {
            limit: ctx.limits.max_for_each_items as u64,
        });
    }
    Ok(())
}

/// An item result embeds as a JSON value when it parses, else as a string.
fn parse_item(text: &str) -> Value {
    let trimmed = text.trim_end_matches('\n');
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

fn error_marker(line: usize, kind: &str, message: &str) -> Value {
    json!({ "line": line, "error": { "kind": kind, "message": message } })
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

async fn emit(results: Vec<Value>, output: &mut StageOutput) -> Result<(), EngineError> {
    let json = serde_json::to_string(&results).map_err(EngineError::internal)?;
    output.write(json.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_item_embeds_json_values() {
        assert_eq!(parse_item("1\n"), json!(1));
        assert_eq!(parse_item("{\"a\":1}\n"), json!({"a":1}));
        assert_eq!(parse_item("plain text\n"), json!("plain text"));
    }

    #[test]
    fn error_marker_names_line_and_kind() {
        let marker = error_marker(3, "command_failed", "exit code 2: boom");
        assert_eq!(marker["line"], 3);
        assert_eq!(marker["error"]["kind"], "command_failed");
    }
}
