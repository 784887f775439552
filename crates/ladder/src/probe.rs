//! Source probing.
//!
//! Determines the native resolution of a staged source by running ffprobe and
//! reading the first video stream.

use crate::ladder::Resolution;
use crate::process::{run_supervised, stderr_tail, Supervised};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Error type for probe operations.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// ffprobe ran but rejected the input (corrupt or unsupported container).
    #[error("ffprobe failed: {0}")]
    FfprobeFailed(String),

    /// Failed to parse ffprobe JSON output.
    #[error("Failed to parse ffprobe output: {0}")]
    ParseError(String),

    /// The container has no usable video stream.
    #[error("No video stream found")]
    NoVideoStream,

    /// ffprobe did not finish in time.
    #[error("ffprobe timed out after {0:?}")]
    TimedOut(Duration),

    /// Probing was abandoned because the job was cancelled.
    #[error("Probe cancelled")]
    Cancelled,

    /// IO error starting ffprobe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Anything that can report the native resolution of a media file.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path, cancel: &CancellationToken)
        -> Result<Resolution, ProbeError>;
}

/// Raw ffprobe JSON structures for parsing.
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub streams: Option<Vec<Stream>>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Stream {
        pub codec_type: Option<String>,
        pub width: Option<u32>,
        pub height: Option<u32>,
    }
}

/// Parses ffprobe JSON output into the resolution of the first video stream.
pub fn parse_ffprobe_output(json_str: &str) -> Result<Resolution, ProbeError> {
    let ffprobe: ffprobe_json::FfprobeOutput =
        serde_json::from_str(json_str).map_err(|e| ProbeError::ParseError(e.to_string()))?;

    let stream = ffprobe
        .streams
        .unwrap_or_default()
        .into_iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(ProbeError::NoVideoStream)?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            Ok(Resolution::new(width, height))
        }
        _ => Err(ProbeError::ParseError(
            "video stream is missing width/height".to_string(),
        )),
    }
}

/// [`Prober`] backed by the ffprobe binary.
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Build `ffprobe -v error -print_format json -show_streams <path>`
    pub fn build_command(&self, path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(["-v", "error", "-print_format", "json", "-show_streams"])
            .arg(path);
        cmd
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn probe(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Resolution, ProbeError> {
        let mut cmd = self.build_command(path);

        let output = match run_supervised(&mut cmd, self.timeout, cancel).await? {
            Supervised::Finished(output) => output,
            Supervised::TimedOut => return Err(ProbeError::TimedOut(self.timeout)),
            Supervised::Cancelled => return Err(ProbeError::Cancelled),
        };

        if !output.status.success() {
            return Err(ProbeError::FfprobeFailed(format!(
                "ffprobe exited with status {}: {}",
                output.status,
                stderr_tail(&output, 5)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(&stdout)
    }
}
