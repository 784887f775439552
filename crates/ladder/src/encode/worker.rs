//! Single-tier encode worker.

use super::{EncodeError, EncodeFailure, TranscodeRequest, Transcoder};
use crate::ladder::RenditionTier;
use crate::staging::PartialFile;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs one transcoder invocation for one tier and validates what it left behind.
///
/// The output file only survives when the transcoder reports success *and*
/// the file exists and is non-empty. Every other path, including the future
/// being dropped mid-encode, removes it.
#[derive(Clone)]
pub struct EncodeWorker {
    transcoder: Arc<dyn Transcoder>,
}

impl EncodeWorker {
    pub fn new(transcoder: Arc<dyn Transcoder>) -> Self {
        Self { transcoder }
    }

    /// Encode `source` at `tier` into `output_path`. Returns the output size in bytes.
    pub async fn encode(
        &self,
        source: &Path,
        tier: &RenditionTier,
        output_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, EncodeError> {
        let tier_error = |cause| EncodeError {
            tier_label: tier.label.to_string(),
            cause,
        };

        let partial = PartialFile::new(output_path.to_path_buf());
        let request = TranscodeRequest {
            input_path: source.to_path_buf(),
            target: tier.target,
            output_path: output_path.to_path_buf(),
        };

        info!(tier = tier.label, target = %tier.target, "encoding rendition");
        let started = Instant::now();

        self.transcoder
            .transcode(&request, cancel)
            .await
            .map_err(tier_error)?;

        let size_bytes = match tokio::fs::metadata(output_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            _ => return Err(tier_error(EncodeFailure::MissingOutput)),
        };
        if size_bytes == 0 {
            return Err(tier_error(EncodeFailure::EmptyOutput));
        }

        partial.keep();
        debug!(
            tier = tier.label,
            size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rendition encoded"
        );
        Ok(size_bytes)
    }
}
