//! Per-kind stage executors.
//!
//! Each executor consumes an upstream byte stream and writes its result into
//! a [`StageOutput`] — the downstream pipe plus, when `save_to` is set, a
//! tee into the buffer store. Executors observe the cancellation token at
//! every suspension point.

use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use mcsh_types::{CommandStage, EngineError, PreviewStage, Stage, ToolStage};

use crate::buffers::Capture;
use crate::pipe::{PipeReader, PipeWriter};
use crate::preview;
use crate::spawn;

use super::{for_each, StageContext};

/// What a finished stage reports back to the orchestrator.
pub(crate) struct StageReport {
    pub elapsed_ms: u64,
    pub bytes_out: u64,
    pub warnings: Vec<String>,
}

/// A stage's output: the downstream pipe, an optional buffer tee, and a
/// byte counter.
pub(crate) struct StageOutput {
    writer: Option<PipeWriter>,
    capture: Option<Capture>,
    bytes_out: u64,
}

impl StageOutput {
    pub(crate) fn new(writer: PipeWriter, capture: Option<Capture>) -> Self {
        Self {
            writer: Some(writer),
            capture,
            bytes_out: 0,
        }
    }

    /// Tee one chunk: capture first (bounded), then forward downstream.
    ///
    /// A broken downstream pipe is not an error here — the consumer decided
    /// it needed no more input — but it marks the output closed so the
    /// producer can stop early.
    pub(crate) async fn write(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        if let Some(capture) = &mut self.capture {
            capture.push(chunk)?;
        }
        self.bytes_out += chunk.len() as u64;
        if let Some(writer) = &self.writer {
            if writer.write_all(chunk).await.is_err() {
                self.writer = None;
            }
        }
        Ok(())
    }

    /// Whether the downstream consumer has gone away.
    fn closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Commit the tee (if any) and return the bytes produced. Dropping the
    /// writer afterwards signals EOF downstream.
    fn finish(self) -> Result<u64, EngineError> {
        if let Some(capture) = self.capture {
            capture.commit()?;
        }
        Ok(self.bytes_out)
    }
}

/// Run one stage to completion. Spawned as a task by the orchestrator.
pub(crate) async fn run_stage(
    stage: Stage,
    upstream: PipeReader,
    mut output: StageOutput,
    ctx: StageContext,
) -> Result<StageReport, EngineError> {
    let started = Instant::now();

    let warnings = match stage {
        Stage::Tool(spec) if spec.for_each => {
            for_each::run_tool(spec, upstream, &mut output, &ctx).await?
        }
        Stage::Tool(spec) => run_tool(spec, upstream, &mut output, &ctx).await?,
        Stage::Command(spec) if spec.for_each => {
            for_each::run_command(spec, upstream, &mut output, &ctx).await?
        }
        Stage::Command(spec) => run_command(spec, upstream, &mut output, &ctx).await?,
        Stage::Preview(spec) => run_preview(spec, upstream, &mut output, &ctx).await?,
        Stage::ReadBuffers(_) => {
            // Handled inline by the orchestrator.
            return Err(EngineError::internal("read_buffers reached an executor"));
        }
    };

    let bytes_out = output.finish()?;
    Ok(StageReport {
        elapsed_ms: started.elapsed().as_millis() as u64,
        bytes_out,
        warnings,
    })
}

/// Materialize a stream up to `cap` bytes, observing cancellation.
pub(crate) async fn read_capped(
    reader: &mut PipeReader,
    cap: usize,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, EngineError> {
    let mut data = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return Ok(data),
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    if data.len() > cap {
                        return Err(EngineError::BufferLimitExceeded { limit: cap as u64 });
                    }
                }
                Err(e) => return Err(EngineError::internal(e)),
            },
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        }
    }
}

/// Tool stage without for_each: one invocation over the whole upstream.
async fn run_tool(
    spec: ToolStage,
    mut upstream: PipeReader,
    output: &mut StageOutput,
    ctx: &StageContext,
) -> Result<Vec<String>, EngineError> {
    let input = read_capped(&mut upstream, ctx.limits.max_stage_input_bytes, &ctx.cancel).await?;
    drop(upstream);

    let mut warnings = Vec::new();
    let mut args = spec.args.clone();
    let text = String::from_utf8_lossy(&input);
    let trimmed = text.trim();

    // Upstream data is bound under the conventional `input` key only when
    // the tool's declared schema asks for it; tool stages usually open a
    // pipeline segment and ignore their upstream.
    if !trimmed.is_empty() && !args.contains_key("input") {
        match ctx.invoker.describe(&spec.server, &spec.name).await {
            Ok(descriptor) if descriptor.has_property("input") => {
                let value = serde_json::from_str(trimmed)
                    .unwrap_or_else(|_| serde_json::Value::String(trimmed.to_string()));
                args.insert("input".to_string(), value);
            }
            Ok(_) => {
                tracing::debug!(
                    server = %spec.server,
                    tool = %spec.name,
                    "tool schema has no 'input' property; upstream discarded"
                );
            }
            Err(e) => {
                warnings.push(format!(
                    "could not inspect schema of {}/{}: {e}",
                    spec.server, spec.name
                ));
            }
        }
    }

    let invocation = ctx
        .invoker
        .invoke(&spec.server, &spec.name, args, &ctx.cancel);
    let mut result = match tokio::time::timeout(ctx.limits.tool_timeout, invocation).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            return Err(EngineError::ToolInvocation {
                server: spec.server.clone(),
                tool: spec.name.clone(),
                message: format!(
                    "timed out after {}s",
                    ctx.limits.tool_timeout.as_secs_f64()
                ),
            })
        }
    };

    // Keep downstream line processing well-formed.
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    output.write(result.as_bytes()).await?;
    Ok(warnings)
}

/// Command stage without for_each: one subprocess streaming end to end.
async fn run_command(
    spec: CommandStage,
    upstream: PipeReader,
    output: &mut StageOutput,
    ctx: &StageContext,
) -> Result<Vec<String>, EngineError> {
    let timeout = spec
        .timeout_secs
        .map(Duration::from_secs_f64)
        .unwrap_or(ctx.limits.command_timeout);

    let mut child = spawn::spawn_allowed(&spec.command, &spec.args)?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| EngineError::internal("child stdin missing"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EngineError::internal("child stderr missing"))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| EngineError::internal("child stdout missing"))?;

    // Pump upstream into the child; EOF closes its stdin. A broken pipe
    // means the child stopped reading — its exit status tells that story.
    let pump = tokio::spawn(async move {
        let mut upstream = upstream;
        let mut stdin = stdin;
        let _ = tokio::io::copy(&mut upstream, &mut stdin).await;
        let _ = stdin.shutdown().await;
    });
    let stderr_task = tokio::spawn(spawn::read_stderr_tail(stderr));

    let deadline = tokio::time::Instant::now() + timeout;
    let mut produced_visible = false;
    let mut buf = [0u8; 8192];

    let timed_out = |command: &str| EngineError::CommandFailed {
        command: command.to_string(),
        exit_code: 124,
        stderr_tail: format!("timed out after {}s", timeout.as_secs_f64()),
    };

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    produced_visible |= buf[..n].iter().any(|b| !b.is_ascii_whitespace());
                    output.write(&buf[..n]).await?;
                    if output.closed() {
                        spawn::terminate_gracefully(&mut child).await;
                        break;
                    }
                }
                Err(e) => {
                    pump.abort();
                    spawn::terminate_gracefully(&mut child).await;
                    return Err(EngineError::internal(e));
                }
            },
            _ = ctx.cancel.cancelled() => {
                pump.abort();
                spawn::terminate_gracefully(&mut child).await;
                return Err(EngineError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => {
                pump.abort();
                let _ = child.kill().await;
                return Err(timed_out(&spec.command));
            }
        }
    }
    pump.abort();

    let status = tokio::select! {
        status = child.wait() => status.map_err(EngineError::internal)?,
        _ = ctx.cancel.cancelled() => {
            spawn::terminate_gracefully(&mut child).await;
            return Err(EngineError::Cancelled);
        }
        _ = tokio::time::sleep_until(deadline) => {
            let _ = child.kill().await;
            return Err(timed_out(&spec.command));
        }
    };
    let stderr_tail = stderr_task.await.unwrap_or_default();

    let code = status.code().unwrap_or(-1);
    if code != 0 && !produced_visible && !stderr_tail.is_empty() {
        return Err(EngineError::CommandFailed {
            command: spec.command.clone(),
            exit_code: code,
            stderr_tail,
        });
    }

    let mut warnings = Vec::new();
    if code != 0 {
        warnings.push(format!("'{}' exited with code {code}", spec.command));
    }
    if !stderr_tail.is_empty() {
        warnings.push(format!("'{}' stderr: {stderr_tail}", spec.command));
    }
    Ok(warnings)
}

/// Preview stage: summarize the whole upstream within the character budget.
async fn run_preview(
    spec: PreviewStage,
    mut upstream: PipeReader,
    output: &mut StageOutput,
    ctx: &StageContext,
) -> Result<Vec<String>, EngineError> {
    // Consume everything so no unread stream is left open upstream.
    let input = read_capped(&mut upstream, ctx.limits.max_stage_input_bytes, &ctx.cancel).await?;
    drop(upstream);

    let summary = preview::summarize(&String::from_utf8_lossy(&input), spec.chars);
    output.write(summary.as_bytes()).await?;
    Ok(Vec::new())
}
