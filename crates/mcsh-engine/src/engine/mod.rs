//! Pipeline orchestration.
//!
//! The orchestrator validates a pipeline, wires its stages together with
//! bounded byte pipes, drains the terminal stream, and returns a structured
//! envelope. Stages run as spawned tasks so stage *i+1* consumes bytes as
//! soon as stage *i* produces them, but the semantics stay sequential: no
//! two stages ever compete for the same input.
//!
//! ```text
//!   seed ──▶ [stage 0 task] ──pipe──▶ [stage 1 task] ──pipe──▶ drain
//!                 │ tee (save_to)
//!                 ▼
//!             BufferStore
//! ```
//!
//! Every spawned task is joined before the envelope is returned, so a
//! completed call leaves no child processes and no dangling tasks behind,
//! whichever way the pipeline ended.

mod for_each;
mod stage;

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mcsh_types::{Envelope, EngineError, Limits, PipelineStatus, Stage, StageDiagnostic};

use crate::buffers::{BufferStore, Capture};
use crate::pipe::{byte_pipe, PipeReader, PIPE_CAPACITY};
use crate::pool::ToolInvoker;
use crate::validate;

use stage::{StageOutput, StageReport};

/// The pipeline execution engine.
///
/// Owns the limits and a handle to the tool invoker (the session pool in
/// production). One engine serves many pipeline invocations; per-invocation
/// state (buffers, cancellation) never leaks between calls.
pub struct Engine {
    limits: Arc<Limits>,
    invoker: Arc<dyn ToolInvoker>,
}

/// Everything a stage task needs at runtime.
#[derive(Clone)]
pub(crate) struct StageContext {
    pub limits: Arc<Limits>,
    pub buffers: Arc<BufferStore>,
    pub invoker: Arc<dyn ToolInvoker>,
    pub cancel: CancellationToken,
}

type StageHandle = (usize, &'static str, JoinHandle<Result<StageReport, EngineError>>);

impl Engine {
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self::with_limits(invoker, Limits::default())
    }

    pub fn with_limits(invoker: Arc<dyn ToolInvoker>, limits: Limits) -> Self {
        Self {
            limits: Arc::new(limits),
            invoker,
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Execute a pipeline end to end.
    ///
    /// Never returns `Err`: failures are reported through the envelope's
    /// status so diagnostics gathered before the failure survive.
    pub async fn execute(
        &self,
        stages: Vec<Stage>,
        initial_input: Option<String>,
        cancel: CancellationToken,
    ) -> Envelope {
        if let Err((stage, error)) = validate::validate(&stages) {
            tracing::debug!(%error, "pipeline rejected");
            return Envelope::error(&error, stage, Vec::new());
        }

        let ctx = StageContext {
            limits: self.limits.clone(),
            buffers: Arc::new(BufferStore::new(self.limits.max_buffer_bytes)),
            invoker: self.invoker.clone(),
            cancel,
        };

        self.run(stages, initial_input, ctx).await
    }

    async fn run(
        &self,
        stages: Vec<Stage>,
        initial_input: Option<String>,
        ctx: StageContext,
    ) -> Envelope {
        let total = stages.len();
        let mut diagnostics: Vec<StageDiagnostic> = Vec::with_capacity(total);
        let mut failure: Option<(usize, EngineError)> = None;
        let mut handles: Vec<StageHandle> = Vec::new();

        let mut upstream = seed_stream(initial_input.unwrap_or_default().into_bytes()).await;

        for (idx, stage) in stages.into_iter().enumerate() {
            if ctx.cancel.is_cancelled() || failure.is_some() {
                break;
            }
            let kind = stage.kind();
            tracing::debug!(stage = idx, kind, "starting stage");

            match stage {
                Stage::ReadBuffers(spec) => {
                    // read_buffers consumes no upstream data; dispose of the
                    // stream and wait for every earlier stage so the
                    // snapshots it reads are complete.
                    drop(upstream);
                    join_stages(&mut handles, &mut diagnostics, &mut failure).await;
                    if failure.is_some() {
                        upstream = seed_stream(Vec::new()).await;
                        break;
                    }

                    let started = Instant::now();
                    let (json, warnings) = ctx.buffers.render(&spec.buffers);
                    diagnostics.push(StageDiagnostic {
                        stage: idx,
                        kind: kind.to_string(),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        bytes_out: json.len() as u64,
                        warnings,
                    });
                    upstream = seed_stream(json.into_bytes()).await;
                }
                stage => {
                    let (writer, reader) = byte_pipe(PIPE_CAPACITY);
                    let output = StageOutput::new(
                        writer,
                        stage
                            .save_to()
                            .map(|name| Capture::new(name, ctx.buffers.clone())),
                    );
                    let stage_ctx = ctx.clone();
                    let handle =
                        tokio::spawn(stage::run_stage(stage, upstream, output, stage_ctx));
                    handles.push((idx, kind, handle));
                    upstream = reader;
                }
            }
        }

        let (output, truncated, drained) =
            drain_stream(upstream, ctx.limits.max_output_bytes, &ctx.cancel).await;

        // Reap every stage task before reporting anything.
        join_stages(&mut handles, &mut diagnostics, &mut failure).await;

        if ctx.cancel.is_cancelled() {
            tracing::info!("pipeline cancelled");
            return Envelope::cancelled(diagnostics);
        }
        if let Some((idx, error)) = failure {
            if matches!(error, EngineError::Cancelled) {
                return Envelope::cancelled(diagnostics);
            }
            tracing::info!(stage = idx, %error, "pipeline failed");
            return Envelope::error(&error, Some(idx), diagnostics);
        }
        if let Err(error) = drained {
            if matches!(error, EngineError::Cancelled) {
                return Envelope::cancelled(diagnostics);
            }
            return Envelope::error(&error, None, diagnostics);
        }

        if truncated {
            let warning = format!(
                "final output truncated to {} bytes",
                ctx.limits.max_output_bytes
            );
            match diagnostics.last_mut() {
                Some(last) => last.warnings.push(warning),
                None => tracing::warn!("{warning}"),
            }
        }

        Envelope {
            output: String::from_utf8_lossy(&output).into_owned(),
            diagnostics,
            status: PipelineStatus::Ok,
        }
    }
}

/// Await stage tasks in pipeline order, collecting diagnostics and the
/// earliest failure.
async fn join_stages(
    handles: &mut Vec<StageHandle>,
    diagnostics: &mut Vec<StageDiagnostic>,
    failure: &mut Option<(usize, EngineError)>,
) {
    for (idx, kind, handle) in handles.drain(..) {
        match handle.await {
            Ok(Ok(report)) => diagnostics.push(StageDiagnostic {
                stage: idx,
                kind: kind.to_string(),
                elapsed_ms: report.elapsed_ms,
                bytes_out: report.bytes_out,
                warnings: report.warnings,
            }),
            Ok(Err(error)) => {
                if failure.is_none() {
                    *failure = Some((idx, error));
                }
            }
            Err(join_error) => {
                if failure.is_none() {
                    *failure = Some((idx, EngineError::internal(join_error)));
                }
            }
        }
    }
}

/// A reader that yields exactly `bytes` then EOF.
async fn seed_stream(bytes: Vec<u8>) -> PipeReader {
    let (writer, reader) = byte_pipe(bytes.len().max(1));
    if !bytes.is_empty() {
        // Capacity covers the whole seed, so this never suspends.
        let _ = writer.write_all(&bytes).await;
    }
    reader
}

/// Read the terminal stream to EOF, keeping at most `cap` bytes.
async fn drain_stream(
    mut reader: PipeReader,
    cap: usize,
    cancel: &CancellationToken,
) -> (Vec<u8>, bool, Result<(), EngineError>) {
    let mut out = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => return (out, truncated, Ok(())),
                Ok(n) => {
                    let room = cap.saturating_sub(out.len());
                    let take = n.min(room);
                    out.extend_from_slice(&buf[..take]);
                    if take < n {
                        truncated = true;
                    }
                }
                Err(e) => return (out, truncated, Err(EngineError::internal(e))),
            },
            _ = cancel.cancelled() => return (out, truncated, Err(EngineError::Cancelled)),
        }
    }
}
