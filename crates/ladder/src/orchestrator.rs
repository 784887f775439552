//! Encode orchestrator module
//!
//! Runs one job end to end: stage the upload, probe it, plan its ladder, encode
//! every tier through a bounded worker pool, relocate and record each finished
//! rendition, then discard the staged source once every tier has settled.
//!
//! Every failure becomes part of the returned [`JobOutcome`]; nothing past this
//! boundary sees an `Err`.

use crate::concurrency::ConcurrencyPlan;
use crate::config::Config;
use crate::encode::{EncodeError, EncodeWorker, FfmpegTranscoder, Transcoder};
use crate::ladder::{plan, RenditionLadder, RenditionTier, Resolution};
use crate::metrics::{JobStage, SharedMetrics};
use crate::naming::RenditionNamer;
use crate::probe::{FfprobeProber, ProbeError, Prober};
use crate::staging::{SourceAsset, StagingManager, StorageError, Upload};
use crate::store::{
    check_name, current_timestamp_ms, JsonRenditionStore, RenditionOutput, RenditionStore,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Message reported when the job ran to the end
pub const SUCCESS_MESSAGE: &str = "Video saved successfully";

/// Errors that end a job early
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Probe(ProbeError),

    /// No bucket matches the probed resolution
    #[error("Unsupported resolution")]
    UnsupportedResolution(Resolution),

    #[error("Job cancelled")]
    Cancelled,
}

impl From<ProbeError> for JobError {
    fn from(err: ProbeError) -> Self {
        match err {
            ProbeError::Cancelled => JobError::Cancelled,
            other => JobError::Probe(other),
        }
    }
}

impl JobError {
    pub fn kind(&self) -> FailureKind {
        match self {
            JobError::Storage(_) => FailureKind::Storage,
            JobError::Probe(_) => FailureKind::Probe,
            JobError::UnsupportedResolution(_) => FailureKind::UnsupportedResolution,
            JobError::Cancelled => FailureKind::Cancelled,
        }
    }
}

/// Category of a fatal job failure
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Storage,
    Probe,
    UnsupportedResolution,
    Cancelled,
}

/// Why one tier did not produce a recorded rendition
#[derive(Debug, Error)]
enum TierError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("tier cancelled")]
    Cancelled,
}

/// A tier that ended without a recorded rendition
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TierFailure {
    pub tier_label: String,
    pub error: String,
}

/// Coarse result of a job, derived from its outcome
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Every planned tier was recorded
    Complete,
    /// The job ran to the end but some tiers failed
    Partial,
    Failed,
}

/// Everything a caller learns about a job
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    /// True when the job ran to the end, even if some tiers failed.
    /// See [`JobOutcome::status`] for a view that accounts for `failed`.
    pub success: bool,
    pub message: String,
    pub failure_kind: Option<FailureKind>,
    /// Recorded renditions, in ladder order
    pub completed: Vec<RenditionOutput>,
    /// Failed tiers, in ladder order
    pub failed: Vec<TierFailure>,
}

impl JobOutcome {
    fn finished(job_id: String, completed: Vec<RenditionOutput>, failed: Vec<TierFailure>) -> Self {
        Self {
            job_id,
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
            failure_kind: None,
            completed,
            failed,
        }
    }

    fn fatal(
        job_id: String,
        err: &JobError,
        completed: Vec<RenditionOutput>,
        failed: Vec<TierFailure>,
    ) -> Self {
        Self {
            job_id,
            success: false,
            message: err.to_string(),
            failure_kind: Some(err.kind()),
            completed,
            failed,
        }
    }

    pub fn status(&self) -> JobStatus {
        if !self.success || (self.completed.is_empty() && !self.failed.is_empty()) {
            JobStatus::Failed
        } else if self.failed.is_empty() {
            JobStatus::Complete
        } else {
            JobStatus::Partial
        }
    }
}

/// Everything one tier task needs, owned so it can be spawned
struct TierTask {
    job_id: String,
    tier: RenditionTier,
    file_name: String,
    source_path: PathBuf,
    working_dir: PathBuf,
    staging: StagingManager,
    worker: EncodeWorker,
    store: Arc<dyn RenditionStore>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl TierTask {
    async fn run(self) -> Result<RenditionOutput, TierError> {
        let _permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TierError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| TierError::Cancelled)?
            }
        };

        let working_path = self.working_dir.join(&self.file_name);
        let size_bytes = self
            .worker
            .encode(&self.source_path, &self.tier, &working_path, &self.cancel)
            .await?;

        if self.cancel.is_cancelled() {
            remove_quietly(&working_path).await;
            return Err(TierError::Cancelled);
        }

        let final_path = self.staging.output_path(&self.file_name);
        if let Err(e) = self.staging.relocate(&working_path, &final_path).await {
            remove_quietly(&working_path).await;
            return Err(e.into());
        }

        let output = RenditionOutput {
            job_id: self.job_id.clone(),
            tier_label: self.tier.label.to_string(),
            file_name: self.file_name.clone(),
            storage_path: final_path.clone(),
            width: self.tier.target.width,
            height: self.tier.target.height,
            size_bytes,
            created_at: current_timestamp_ms(),
        };

        if let Err(e) = self.store.save(&output).await {
            // An unrecorded rendition is unreachable, so it goes too
            remove_quietly(&final_path).await;
            return Err(e.into());
        }

        info!(
            job_id = %self.job_id,
            tier = self.tier.label,
            path = %final_path.display(),
            size_bytes,
            "rendition saved"
        );
        Ok(output)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove file");
        }
    }
}

/// Position of a tier label in the ladder, unknown labels last
fn ladder_position(ladder: &RenditionLadder, label: &str) -> usize {
    ladder
        .tiers()
        .iter()
        .position(|t| t.label == label)
        .unwrap_or(usize::MAX)
}

/// Drives jobs from upload to recorded renditions
///
/// Uses a tokio Semaphore to limit the number of concurrent tier encodes
/// according to the concurrency plan. The limit is shared by every job run
/// through the same orchestrator.
#[derive(Clone)]
pub struct EncodeOrchestrator {
    staging: StagingManager,
    prober: Arc<dyn Prober>,
    worker: EncodeWorker,
    store: Arc<dyn RenditionStore>,
    semaphore: Arc<Semaphore>,
    concurrency_plan: ConcurrencyPlan,
    metrics: SharedMetrics,
}

impl EncodeOrchestrator {
    pub fn new(
        staging: StagingManager,
        prober: Arc<dyn Prober>,
        transcoder: Arc<dyn Transcoder>,
        store: Arc<dyn RenditionStore>,
        plan: ConcurrencyPlan,
        metrics: SharedMetrics,
    ) -> Self {
        let permits = plan.max_concurrent_tiers.max(1) as usize;
        Self {
            staging,
            prober,
            worker: EncodeWorker::new(transcoder),
            store,
            semaphore: Arc::new(Semaphore::new(permits)),
            concurrency_plan: plan,
            metrics,
        }
    }

    /// Wire up ffprobe, ffmpeg and the JSON store from configuration
    pub fn from_config(cfg: &Config, metrics: SharedMetrics) -> Self {
        let plan = ConcurrencyPlan::derive(cfg);
        let prober = FfprobeProber::new(
            &cfg.encode.ffprobe_path,
            Duration::from_secs(cfg.encode.probe_timeout_secs),
        );
        let transcoder = FfmpegTranscoder::new(
            &cfg.encode.ffmpeg_path,
            Duration::from_secs(cfg.encode.timeout_secs),
            plan.threads_per_encode,
        );
        let store = JsonRenditionStore::new(cfg.storage.state_dir.clone());

        Self::new(
            StagingManager::from_config(&cfg.storage),
            Arc::new(prober),
            Arc::new(transcoder),
            Arc::new(store),
            plan,
            metrics,
        )
    }

    /// Get the number of tier slots currently free
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the concurrency plan
    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.concurrency_plan
    }

    pub fn staging(&self) -> &StagingManager {
        &self.staging
    }

    /// Run a job to completion
    pub async fn run(&self, upload: Upload) -> JobOutcome {
        self.run_with_cancel(upload, CancellationToken::new()).await
    }

    /// Run a job, abandoning it once `cancel` fires
    ///
    /// On cancellation, in-flight encodes are killed and their output removed,
    /// tiers not yet started never start, and no rendition is recorded from an
    /// encode that finished after the cancellation was observed. The staged
    /// source is still removed after every tier has stopped.
    ///
    /// The job runs on its own task. Dropping the returned future (a caller
    /// timeout, say) cancels the job, which then winds down in the same order.
    pub async fn run_with_cancel(&self, upload: Upload, cancel: CancellationToken) -> JobOutcome {
        let job_id = upload.job_id().to_string();
        let job_cancel = cancel.child_token();
        let guard = job_cancel.clone().drop_guard();

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_job(upload, job_cancel).await });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job task ended abnormally");
                self.metrics
                    .write()
                    .await
                    .job_finished(&job_id, false, current_timestamp_ms());
                JobOutcome {
                    job_id,
                    success: false,
                    message: "Job task panicked".to_string(),
                    failure_kind: None,
                    completed: Vec::new(),
                    failed: Vec::new(),
                }
            }
        };
        guard.disarm();
        outcome
    }

    async fn run_job(&self, upload: Upload, cancel: CancellationToken) -> JobOutcome {
        let job_id = upload.job_id().to_string();
        info!(job_id = %job_id, name = upload.original_name(), "job started");
        self.metrics
            .write()
            .await
            .job_started(&job_id, current_timestamp_ms());

        let outcome = self.execute(job_id.clone(), upload, &cancel).await;

        self.metrics
            .write()
            .await
            .job_finished(&job_id, outcome.success, current_timestamp_ms());

        if outcome.success {
            info!(
                job_id = %job_id,
                completed = outcome.completed.len(),
                failed = outcome.failed.len(),
                "job finished"
            );
        } else {
            error!(job_id = %job_id, message = %outcome.message, "job failed");
        }
        outcome
    }

    async fn execute(&self, job_id: String, upload: Upload, cancel: &CancellationToken) -> JobOutcome {
        if let Err(e) = check_name(&job_id) {
            return JobOutcome::fatal(job_id, &JobError::Storage(e), Vec::new(), Vec::new());
        }
        if cancel.is_cancelled() {
            return JobOutcome::fatal(job_id, &JobError::Cancelled, Vec::new(), Vec::new());
        }

        let mut source = match self.staging.stage(upload).await {
            Ok(source) => source,
            Err(e) => {
                return JobOutcome::fatal(job_id, &JobError::Storage(e), Vec::new(), Vec::new())
            }
        };

        self.set_stage(&job_id, JobStage::Probing).await;
        let resolution = match self.prober.probe(source.path(), cancel).await {
            Ok(resolution) => resolution,
            Err(e) => return self.abort(job_id, source, JobError::from(e)).await,
        };
        source.attach_probe(resolution);
        debug!(job_id = %job_id, resolution = %resolution, "probed source");

        self.set_stage(&job_id, JobStage::Planning).await;
        let ladder = plan(resolution);
        if ladder.is_empty() {
            warn!(job_id = %job_id, resolution = %resolution, "no ladder for source resolution");
            return self
                .abort(job_id, source, JobError::UnsupportedResolution(resolution))
                .await;
        }
        self.metrics
            .write()
            .await
            .set_tiers_total(&job_id, ladder.len());

        let working_dir = match self.staging.working_dir().await {
            Ok(dir) => dir,
            Err(e) => return self.abort(job_id, source, JobError::Storage(e)).await,
        };

        self.set_stage(&job_id, JobStage::Encoding).await;
        info!(job_id = %job_id, tiers = ?ladder.labels(), "encoding ladder");
        let (completed, failed, mut fatal) = self
            .encode_ladder(&job_id, &source, &ladder, working_dir, cancel)
            .await;

        if fatal.is_none() && cancel.is_cancelled() {
            fatal = Some(JobError::Cancelled);
        }

        self.set_stage(&job_id, JobStage::Finalizing).await;
        if let Err(e) = self.staging.discard(&mut source).await {
            error!(job_id = %job_id, error = %e, "failed to discard staged source");
            if fatal.is_none() {
                fatal = Some(JobError::Storage(e));
            }
        }
        self.set_stage(&job_id, JobStage::Done).await;

        match fatal {
            Some(err) => JobOutcome::fatal(job_id, &err, completed, failed),
            None => JobOutcome::finished(job_id, completed, failed),
        }
    }

    /// Fan the ladder out to tier tasks and wait for every one of them
    async fn encode_ladder(
        &self,
        job_id: &str,
        source: &SourceAsset,
        ladder: &RenditionLadder,
        working_dir: PathBuf,
        cancel: &CancellationToken,
    ) -> (Vec<RenditionOutput>, Vec<TierFailure>, Option<JobError>) {
        let tier_cancel = cancel.child_token();
        let namer = RenditionNamer::new();
        let mut tasks = JoinSet::new();

        for tier in ladder.tiers() {
            let task = TierTask {
                job_id: job_id.to_string(),
                tier: *tier,
                file_name: namer.name(tier),
                source_path: source.path().to_path_buf(),
                working_dir: working_dir.clone(),
                staging: self.staging.clone(),
                worker: self.worker.clone(),
                store: self.store.clone(),
                semaphore: self.semaphore.clone(),
                cancel: tier_cancel.clone(),
            };
            let label = tier.label;
            tasks.spawn(async move { (label, task.run().await) });
        }

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut settled = HashSet::new();
        let mut fatal = None;

        // Barrier: nothing below runs until every tier task has ended
        while let Some(joined) = tasks.join_next().await {
            let (label, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(job_id = %job_id, error = %e, "tier task ended abnormally");
                    continue;
                }
            };
            settled.insert(label);

            match result {
                Ok(output) => {
                    self.metrics
                        .write()
                        .await
                        .tier_completed(job_id, output.size_bytes);
                    completed.push(output);
                }
                Err(err) => {
                    warn!(job_id = %job_id, tier = label, error = %err, "tier failed");
                    self.metrics.write().await.tier_failed(job_id);
                    failed.push(TierFailure {
                        tier_label: label.to_string(),
                        error: err.to_string(),
                    });

                    if let TierError::Storage(e) = err {
                        if fatal.is_none() {
                            tier_cancel.cancel();
                            fatal = Some(JobError::Storage(e));
                        }
                    }
                }
            }
        }

        for tier in ladder.tiers() {
            if !settled.contains(tier.label) {
                self.metrics.write().await.tier_failed(job_id);
                failed.push(TierFailure {
                    tier_label: tier.label.to_string(),
                    error: "worker task panicked".to_string(),
                });
            }
        }

        completed.sort_by_key(|o| ladder_position(ladder, &o.tier_label));
        failed.sort_by_key(|f| ladder_position(ladder, &f.tier_label));
        (completed, failed, fatal)
    }

    /// End the job before any encode, discarding the staged source
    async fn abort(&self, job_id: String, mut source: SourceAsset, err: JobError) -> JobOutcome {
        if let Err(e) = self.staging.discard(&mut source).await {
            warn!(job_id = %job_id, error = %e, "failed to discard staged source");
        }
        self.set_stage(&job_id, JobStage::Done).await;
        JobOutcome::fatal(job_id, &err, Vec::new(), Vec::new())
    }

    async fn set_stage(&self, job_id: &str, stage: JobStage) {
        self.metrics
            .write()
            .await
            .set_stage(job_id, stage, current_timestamp_ms());
    }
}
