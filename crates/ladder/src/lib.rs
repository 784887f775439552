//! Rendition Ladder
//!
//! Plans the set of downscaled renditions for an uploaded video, drives one
//! external encode per rendition, moves finished files into durable storage and
//! records their metadata.

pub mod concurrency;
pub mod encode;
pub mod ladder;
pub mod metrics;
pub mod naming;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod staging;
pub mod startup;
pub mod store;

pub use rendition_ladder_config as config;
pub use rendition_ladder_config::Config;
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use encode::{EncodeError, EncodeFailure, EncodeWorker, FfmpegTranscoder, TranscodeRequest, Transcoder};
pub use ladder::{find_bucket, plan, Bucket, RenditionLadder, RenditionTier, Resolution, BUCKETS};
pub use metrics::{new_shared_metrics, JobMetrics, JobStage, MetricsSnapshot, SharedMetrics};
pub use naming::RenditionNamer;
pub use orchestrator::{
    EncodeOrchestrator, FailureKind, JobError, JobOutcome, JobStatus, TierFailure, SUCCESS_MESSAGE,
};
pub use probe::{FfprobeProber, ProbeError, Prober};
pub use staging::{SourceAsset, StagingManager, StorageError, Upload};
pub use startup::{check_ffmpeg_version, check_tool_available, parse_ffmpeg_version, run_startup_checks, StartupError};
pub use store::{JsonRenditionStore, RenditionOutput, RenditionStore};
