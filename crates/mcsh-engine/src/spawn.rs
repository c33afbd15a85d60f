//! Subprocess runner for allow-listed commands.
//!
//! Commands are spawned with arguments passed as a distinct vector — never
//! concatenated into a shell-interpreted string — and with all three stdio
//! streams piped. Every child is created with `kill_on_drop` so that an
//! abandoned handle can never leak a process.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;

use mcsh_types::EngineError;

use crate::allowlist;

/// How many trailing stderr bytes are kept for error reporting.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Grace period between SIGTERM and SIGKILL on cancellation.
pub const TERM_GRACE: Duration = Duration::from_secs(2);

/// Everything a finished subprocess left behind.
#[derive(Debug)]
pub struct CollectedOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr_tail: String,
}

impl CollectedOutput {
    /// A non-zero exit is only fatal when the command produced no stdout
    /// but did complain on stderr. `grep` exiting 1 on "no match" stays a
    /// non-error.
    pub fn is_failure(&self) -> bool {
        self.exit_code != 0
            && self.stdout.iter().all(|b| b.is_ascii_whitespace())
            && !self.stderr_tail.trim().is_empty()
    }
}

/// Spawn an allow-listed command with piped stdio.
pub fn spawn_allowed(command: &str, args: &[String]) -> Result<Child, EngineError> {
    if !allowlist::is_allowed(command) {
        return Err(EngineError::CommandNotAllowed {
            command: command.to_string(),
        });
    }

    Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| EngineError::CommandFailed {
            command: command.to_string(),
            exit_code: 127,
            stderr_tail: format!("failed to spawn: {e}"),
        })
}

/// Run a command to completion with the given bytes as its entire stdin.
///
/// Used by the for-each driver, which feeds one line per invocation. The
/// child is killed if the timeout expires or the caller cancels (the future
/// owning it is dropped, and `kill_on_drop` reaps it).
pub async fn run_once(
    command: &str,
    args: &[String],
    input: &[u8],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CollectedOutput, EngineError> {
    let mut child = spawn_allowed(command, args)?;
    let stdin = child.stdin.take();

    let run = async move {
        if let Some(mut stdin) = stdin {
            // Broken pipe here means the child stopped reading early; its
            // exit status tells the rest of the story.
            let _ = stdin.write_all(input).await;
        }
        child.wait_with_output().await
    };

    tokio::select! {
        result = tokio::time::timeout(timeout, run) => match result {
            Ok(Ok(output)) => Ok(CollectedOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr_tail: tail_string(&output.stderr),
            }),
            Ok(Err(e)) => Err(EngineError::CommandFailed {
                command: command.to_string(),
                exit_code: -1,
                stderr_tail: format!("wait failed: {e}"),
            }),
            Err(_) => Err(EngineError::CommandFailed {
                command: command.to_string(),
                exit_code: 124,
                stderr_tail: format!("timed out after {}s", timeout.as_secs_f64()),
            }),
        },
        _ = cancel.cancelled() => Err(EngineError::Cancelled),
    }
}

/// Terminate a child gently: SIGTERM, then SIGKILL after [`TERM_GRACE`].
pub async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(TERM_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

/// Drain a child's stderr, keeping only the trailing bytes.
pub async fn read_stderr_tail(stderr: ChildStderr) -> String {
    let mut stderr = stderr;
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).trim().to_string()
}

fn tail_string(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_once_feeds_stdin_and_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = run_once(
            "tr",
            &["a-z".into(), "A-Z".into()],
            b"hello\n",
            Duration::from_secs(10),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout, b"HELLO\n");
        assert!(!out.is_failure());
    }

    #[tokio::test]
    async fn disallowed_command_never_spawns() {
        let cancel = CancellationToken::new();
        let err = run_once("rm", &["-rf".into(), "/".into()], b"", Duration::from_secs(1), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "command_not_allowed");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let cancel = CancellationToken::new();
        let started = std::time::Instant::now();
        let err = run_once(
            "sleep",
            &["30".into()],
            b"",
            Duration::from_millis(200),
            &cancel,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "command_failed");
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_child() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = run_once("sleep", &["30".into()], b"", Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn grep_no_match_is_not_a_failure() {
        let cancel = CancellationToken::new();
        let out = run_once(
            "grep",
            &["zebra".into()],
            b"apple\nbanana\n",
            Duration::from_secs(10),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(!out.is_failure());
    }
}
