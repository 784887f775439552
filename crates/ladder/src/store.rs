//! Rendition metadata persistence.
//!
//! Each finished rendition is recorded as its own JSON file at
//! `<state_dir>/<job_id>/<tier_label>.json`, so records for different tiers of
//! the same job never touch the same file.

use crate::staging::{PartialFile, StorageError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use uuid::Uuid;

/// Metadata of one finished, relocated rendition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenditionOutput {
    /// Owning job identifier.
    pub job_id: String,
    /// Quality label of the tier, e.g. "720".
    pub tier_label: String,
    /// File name inside the output directory.
    pub file_name: String,
    /// Full durable path of the rendition.
    pub storage_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    /// Unix timestamp (milliseconds) when the record was made.
    pub created_at: i64,
}

/// Where rendition records are saved.
///
/// Implementations must fail loudly rather than drop a record, and concurrent
/// saves of distinct renditions of one job must not clobber each other.
#[async_trait]
pub trait RenditionStore: Send + Sync {
    async fn save(&self, output: &RenditionOutput) -> Result<(), StorageError>;
}

/// [`RenditionStore`] writing one JSON file per rendition.
#[derive(Debug, Clone)]
pub struct JsonRenditionStore {
    state_dir: PathBuf,
}

impl JsonRenditionStore {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    fn job_dir(&self, job_id: &str) -> Result<PathBuf, StorageError> {
        check_name(job_id)?;
        Ok(self.state_dir.join(job_id))
    }

    /// Path of the record for a job's tier
    pub fn record_path(&self, job_id: &str, tier_label: &str) -> Result<PathBuf, StorageError> {
        check_name(tier_label)?;
        Ok(self.job_dir(job_id)?.join(format!("{}.json", tier_label)))
    }

    /// Loads every rendition recorded for `job_id`, highest resolution first.
    ///
    /// An unknown job yields an empty list.
    pub async fn load_job(&self, job_id: &str) -> Result<Vec<RenditionOutput>, StorageError> {
        let dir = self.job_dir(job_id)?;
        let read_err = |source| StorageError::ReadFailed {
            path: dir.clone(),
            source,
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(read_err(e)),
        };

        let mut outputs = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(read_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content = tokio::fs::read_to_string(&path).await.map_err(read_err)?;
            let output: RenditionOutput = serde_json::from_str(&content)
                .map_err(|e| read_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;
            outputs.push(output);
        }

        outputs.sort_by(|a, b| b.height.cmp(&a.height).then(b.width.cmp(&a.width)));
        Ok(outputs)
    }
}

#[async_trait]
impl RenditionStore for JsonRenditionStore {
    async fn save(&self, output: &RenditionOutput) -> Result<(), StorageError> {
        let dir = self.job_dir(&output.job_id)?;
        let path = self.record_path(&output.job_id, &output.tier_label)?;
        let record_err = |source| StorageError::RecordFailed {
            path: path.clone(),
            source,
        };

        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;

        let json = serde_json::to_vec_pretty(output)
            .map_err(|e| record_err(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        // Written under a private name, then linked into place; the link fails
        // if the record exists, so a concurrent save of the same tier loses loudly
        let tmp = PartialFile::new(dir.join(format!(
            "{}.{}.tmp",
            output.tier_label,
            Uuid::new_v4().simple()
        )));
        tokio::fs::write(tmp.path(), &json).await.map_err(record_err)?;
        match tokio::fs::hard_link(tmp.path(), &path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyRecorded(path.clone()));
            }
            Err(e) => return Err(record_err(e)),
        }
        drop(tmp);

        debug!(
            job_id = %output.job_id,
            tier = %output.tier_label,
            path = %path.display(),
            "rendition recorded"
        );
        Ok(())
    }
}

/// Accept only names that map to exactly one normal path component
pub(crate) fn check_name(name: &str) -> Result<(), StorageError> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(()),
        _ => Err(StorageError::InvalidName(name.to_string())),
    }
}

/// Current Unix timestamp in milliseconds
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
