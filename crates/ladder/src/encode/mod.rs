//! Rendition encoding.
//!
//! [`Transcoder`] is the seam to the external engine; [`EncodeWorker`] wraps
//! one invocation per tier and decides whether it actually succeeded.

pub mod ffmpeg;
pub mod worker;

pub use ffmpeg::{build_ffmpeg_command, FfmpegTranscoder, AUDIO_CODEC, CONTAINER_FORMAT, VIDEO_CODEC};
pub use worker::EncodeWorker;

use crate::ladder::Resolution;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a single encode did not produce a usable rendition
#[derive(Debug, Error)]
pub enum EncodeFailure {
    /// The encoder could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(#[from] std::io::Error),

    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code {code}: {stderr}")]
    Exited { code: i32, stderr: String },

    /// Encoder was terminated by signal
    #[error("encoder was terminated by signal")]
    Terminated,

    #[error("encoder timed out after {0:?}")]
    TimedOut(Duration),

    #[error("encode cancelled")]
    Cancelled,

    /// Reported success but left no file behind
    #[error("encoder produced no output file")]
    MissingOutput,

    #[error("encoder produced an empty output file")]
    EmptyOutput,
}

/// A failed encode, tagged with the tier it was for
#[derive(Debug, Error)]
#[error("encode of tier {tier_label} failed: {cause}")]
pub struct EncodeError {
    pub tier_label: String,
    #[source]
    pub cause: EncodeFailure,
}

impl EncodeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, EncodeFailure::Cancelled)
    }
}

/// One resize + encode of the source into a single output file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input_path: PathBuf,
    pub target: Resolution,
    pub output_path: PathBuf,
}

/// The external transcoding engine
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Encode `request.input_path` into `request.output_path` at `request.target`.
    ///
    /// Must stop promptly and return [`EncodeFailure::Cancelled`] once `cancel` fires.
    async fn transcode(
        &self,
        request: &TranscodeRequest,
        cancel: &CancellationToken,
    ) -> Result<(), EncodeFailure>;
}
