//! Metrics module
//!
//! In-memory job and rendition counters shared between the orchestrator and
//! whoever reports on it, with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Where a job currently is in its pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStage {
    Staging,
    Probing,
    Planning,
    Encoding,
    Finalizing,
    Done,
}

/// Per-job progress counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub stage: JobStage,
    pub tiers_total: usize,
    pub tiers_completed: usize,
    pub tiers_failed: usize,
}

/// Snapshot of every in-flight job plus aggregate counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub renditions_completed: u64,
    pub renditions_failed: u64,
    pub total_bytes_encoded: u64,
}

/// Shared metrics state for concurrent access
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

impl MetricsSnapshot {
    fn job_mut(&mut self, job_id: &str) -> Option<&mut JobMetrics> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    pub fn job(&self, job_id: &str) -> Option<&JobMetrics> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    pub(crate) fn job_started(&mut self, job_id: &str, now_ms: i64) {
        self.jobs.push(JobMetrics {
            id: job_id.to_string(),
            stage: JobStage::Staging,
            tiers_total: 0,
            tiers_completed: 0,
            tiers_failed: 0,
        });
        self.running_jobs += 1;
        self.timestamp_unix_ms = now_ms;
    }

    pub(crate) fn set_stage(&mut self, job_id: &str, stage: JobStage, now_ms: i64) {
        if let Some(job) = self.job_mut(job_id) {
            job.stage = stage;
        }
        self.timestamp_unix_ms = now_ms;
    }

    pub(crate) fn set_tiers_total(&mut self, job_id: &str, tiers_total: usize) {
        if let Some(job) = self.job_mut(job_id) {
            job.tiers_total = tiers_total;
        }
    }

    pub(crate) fn tier_completed(&mut self, job_id: &str, size_bytes: u64) {
        if let Some(job) = self.job_mut(job_id) {
            job.tiers_completed += 1;
        }
        self.renditions_completed += 1;
        self.total_bytes_encoded += size_bytes;
    }

    pub(crate) fn tier_failed(&mut self, job_id: &str) {
        if let Some(job) = self.job_mut(job_id) {
            job.tiers_failed += 1;
        }
        self.renditions_failed += 1;
    }

    /// Drops one run of the job from the in-flight list and bumps the aggregate
    /// counters. Runs sharing a job id are retired one at a time.
    pub(crate) fn job_finished(&mut self, job_id: &str, success: bool, now_ms: i64) {
        if let Some(index) = self.jobs.iter().position(|j| j.id == job_id) {
            self.jobs.remove(index);
            self.running_jobs = self.running_jobs.saturating_sub(1);
        }
        if success {
            self.completed_jobs += 1;
        } else {
            self.failed_jobs += 1;
        }
        self.timestamp_unix_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_job_lifecycle_counters() {
        let mut m = MetricsSnapshot::default();
        m.job_started("job-1", 10);
        m.set_stage("job-1", JobStage::Encoding, 20);
        m.set_tiers_total("job-1", 3);
        m.tier_completed("job-1", 1000);
        m.tier_completed("job-1", 500);
        m.tier_failed("job-1");

        let job = m.job("job-1").unwrap();
        assert_eq!(job.stage, JobStage::Encoding);
        assert_eq!(job.tiers_total, 3);
        assert_eq!(job.tiers_completed, 2);
        assert_eq!(job.tiers_failed, 1);
        assert_eq!(m.running_jobs, 1);

        m.job_finished("job-1", true, 30);
        assert!(m.job("job-1").is_none());
        assert_eq!(m.running_jobs, 0);
        assert_eq!(m.completed_jobs, 1);
        assert_eq!(m.failed_jobs, 0);
        assert_eq!(m.renditions_completed, 2);
        assert_eq!(m.renditions_failed, 1);
        assert_eq!(m.total_bytes_encoded, 1500);
        assert_eq!(m.timestamp_unix_ms, 30);
    }

    #[test]
    fn test_runs_sharing_a_job_id_finish_separately() {
        let mut m = MetricsSnapshot::default();
        m.job_started("job-dup", 0);
        m.job_started("job-dup", 0);
        assert_eq!(m.running_jobs, 2);

        m.job_finished("job-dup", true, 0);
        assert_eq!(m.running_jobs, 1);
        assert!(m.job("job-dup").is_some());

        m.job_finished("job-dup", false, 0);
        assert_eq!(m.running_jobs, 0);
        assert!(m.jobs.is_empty());
        assert_eq!(m.completed_jobs, 1);
        assert_eq!(m.failed_jobs, 1);
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&JobStage::Finalizing).unwrap();
        assert_eq!(json, "\"finalizing\"");
    }

    #[tokio::test]
    async fn test_shared_metrics_starts_empty() {
        let metrics = new_shared_metrics();
        let snapshot = metrics.read().await;
        assert!(snapshot.jobs.is_empty());
        assert_eq!(snapshot.running_jobs, 0);
    }

    // *For any* number of finished jobs, running_jobs returns to zero and every
    // job lands in exactly one of completed_jobs / failed_jobs.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_finished_jobs_are_accounted_once(outcomes in prop::collection::vec(any::<bool>(), 0..20)) {
            let mut m = MetricsSnapshot::default();
            for (i, _) in outcomes.iter().enumerate() {
                m.job_started(&format!("job-{}", i), 0);
            }
            prop_assert_eq!(m.running_jobs, outcomes.len());

            for (i, success) in outcomes.iter().enumerate() {
                m.job_finished(&format!("job-{}", i), *success, 0);
            }

            let successes = outcomes.iter().filter(|s| **s).count() as u64;
            prop_assert_eq!(m.running_jobs, 0);
            prop_assert_eq!(m.completed_jobs, successes);
            prop_assert_eq!(m.failed_jobs, outcomes.len() as u64 - successes);
            prop_assert!(m.jobs.is_empty());
        }
    }
}
