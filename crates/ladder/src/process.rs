//! Supervised execution of external tools (ffmpeg, ffprobe).
//!
//! A child is raced against a deadline and a cancellation token. Whichever
//! loses, the child is killed: the command is spawned with `kill_on_drop`, and
//! the wait future owning it is dropped when the race is lost.

use std::io;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a supervised process ended
#[derive(Debug)]
pub enum Supervised {
    /// The process exited on its own; inspect `status`
    Finished(Output),
    /// The deadline passed and the process was killed
    TimedOut,
    /// The token fired and the process was killed
    Cancelled,
}

/// Spawn `cmd` and wait for it, bounded by `timeout` and `cancel`.
///
/// Stdout and stderr are captured. Only spawn and wait failures are errors;
/// a non-zero exit is reported through [`Supervised::Finished`].
pub async fn run_supervised(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> io::Result<Supervised> {
    if cancel.is_cancelled() {
        return Ok(Supervised::Cancelled);
    }

    cmd.kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(cmd = ?cmd.as_std(), "spawning external process");
    let child = cmd.spawn()?;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Supervised::Cancelled),
        waited = tokio::time::timeout(timeout, child.wait_with_output()) => match waited {
            Ok(output) => Ok(Supervised::Finished(output?)),
            Err(_) => Ok(Supervised::TimedOut),
        },
    }
}

/// Last `max_lines` non-empty lines of the process's stderr
pub fn stderr_tail(output: &Output, max_lines: usize) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
