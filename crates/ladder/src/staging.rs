//! Staging area management.
//!
//! Owns every temporary file of a job: the staged copy of the upload and the
//! encoder's working output. Finished renditions leave this module's control
//! only through [`StagingManager::relocate`], which never exposes a
//! half-written destination.

use crate::ladder::Resolution;
use rendition_ladder_config::StorageConfig;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Errors raised while staging, relocating, recording or deleting files.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("Failed to stage upload to {path}: {source}")]
    StageFailed { path: PathBuf, source: io::Error },

    #[error("Rendition file not found: {0}")]
    MissingSource(PathBuf),

    #[error("Failed to move {from} to {to}: {source}")]
    RelocateFailed {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("Failed to delete {path}: {source}")]
    DeleteFailed { path: PathBuf, source: io::Error },

    #[error("Rendition already recorded: {0}")]
    AlreadyRecorded(PathBuf),

    #[error("Failed to write record {path}: {source}")]
    RecordFailed { path: PathBuf, source: io::Error },

    #[error("Failed to read records under {path}: {source}")]
    ReadFailed { path: PathBuf, source: io::Error },

    /// A job id or tier label that is not a single plain path component
    #[error("Invalid record name: {0:?}")]
    InvalidName(String),
}

/// The submitted video: an owning job id plus a byte stream.
pub struct Upload {
    job_id: String,
    original_name: String,
    reader: Pin<Box<dyn AsyncRead + Send>>,
}

impl Upload {
    pub fn from_reader<R>(
        job_id: impl Into<String>,
        original_name: impl Into<String>,
        reader: R,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            job_id: job_id.into(),
            original_name: original_name.into(),
            reader: Box::pin(reader),
        }
    }

    pub fn from_bytes(
        job_id: impl Into<String>,
        original_name: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
    ) -> Self {
        Self::from_reader(job_id, original_name, io::Cursor::new(bytes.into()))
    }

    /// Open a file on disk as an upload
    pub async fn from_path(job_id: impl Into<String>, path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_reader(job_id, original_name, file))
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn original_name(&self) -> &str {
        &self.original_name
    }
}

impl fmt::Debug for Upload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upload")
            .field("job_id", &self.job_id)
            .field("original_name", &self.original_name)
            .finish_non_exhaustive()
    }
}

/// A file that is deleted on drop unless [`PartialFile::keep`] is called.
#[derive(Debug)]
pub(crate) struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn keep(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed partial file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove partial file"),
        }
    }
}

/// The staged copy of an upload.
///
/// Read-only once staged. If it is dropped without
/// [`StagingManager::discard`] having succeeded, the file is removed on drop.
#[derive(Debug)]
pub struct SourceAsset {
    job_id: String,
    path: PathBuf,
    size_bytes: u64,
    resolution: Option<Resolution>,
    discarded: bool,
}

impl SourceAsset {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Probed resolution, once attached
    pub fn resolution(&self) -> Option<Resolution> {
        self.resolution
    }

    pub fn attach_probe(&mut self, resolution: Resolution) {
        self.resolution = Some(resolution);
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }
}

impl Drop for SourceAsset {
    fn drop(&mut self) {
        if self.discarded {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                "staged source removed on drop"
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id = %self.job_id,
                path = %self.path.display(),
                error = %e,
                "failed to remove staged source on drop"
            ),
        }
    }
}

/// Owns the staging, working and output directories.
#[derive(Debug, Clone)]
pub struct StagingManager {
    staging_dir: PathBuf,
    working_dir: PathBuf,
    output_dir: PathBuf,
}

impl StagingManager {
    pub fn new(staging_dir: PathBuf, working_dir: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            staging_dir,
            working_dir,
            output_dir,
        }
    }

    pub fn from_config(cfg: &StorageConfig) -> Self {
        Self::new(
            cfg.staging_dir.clone(),
            cfg.working_dir.clone(),
            cfg.output_dir.clone(),
        )
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Durable destination for a rendition file name
    pub fn output_path(&self, file_name: &str) -> PathBuf {
        self.output_dir.join(file_name)
    }

    /// Persist the upload into the staging area.
    ///
    /// Bytes are written to a `.part` file, synced, then renamed, so a staged
    /// source is always complete. A failed write leaves nothing behind.
    pub async fn stage(&self, mut upload: Upload) -> Result<SourceAsset, StorageError> {
        ensure_dir(&self.staging_dir).await?;

        let file_name = format!(
            "{}_{}.{}",
            sanitize_component(&upload.job_id),
            Uuid::new_v4().simple(),
            staged_extension(&upload.original_name)
        );
        let final_path = self.staging_dir.join(&file_name);
        let partial = PartialFile::new(self.staging_dir.join(format!("{}.part", file_name)));

        let size_bytes = write_synced(&mut upload.reader, partial.path())
            .await
            .map_err(|source| StorageError::StageFailed {
                path: partial.path().to_path_buf(),
                source,
            })?;

        tokio::fs::rename(partial.path(), &final_path)
            .await
            .map_err(|source| StorageError::StageFailed {
                path: final_path.clone(),
                source,
            })?;
        partial.keep();

        info!(
            job_id = %upload.job_id,
            path = %final_path.display(),
            size_bytes,
            "staged upload"
        );

        Ok(SourceAsset {
            job_id: upload.job_id,
            path: final_path,
            size_bytes,
            resolution: None,
            discarded: false,
        })
    }

    /// The encoder output area, created if missing.
    ///
    /// Safe to call concurrently; an already existing directory is fine.
    pub async fn working_dir(&self) -> Result<PathBuf, StorageError> {
        ensure_dir(&self.working_dir).await?;
        Ok(self.working_dir.clone())
    }

    /// Move a finished rendition from the working area to its final location.
    ///
    /// A same-volume rename is tried first. If that fails (e.g. the output
    /// directory is on another device) the file is copied next to the
    /// destination as `.part`, synced and renamed into place, and only then is
    /// the working copy removed.
    pub async fn relocate(&self, temp_path: &Path, final_path: &Path) -> Result<(), StorageError> {
        match tokio::fs::metadata(temp_path).await {
            Ok(meta) if meta.is_file() => {}
            _ => return Err(StorageError::MissingSource(temp_path.to_path_buf())),
        }

        if let Some(parent) = final_path.parent() {
            ensure_dir(parent).await?;
        }

        match tokio::fs::rename(temp_path, final_path).await {
            Ok(()) => {
                debug!(from = %temp_path.display(), to = %final_path.display(), "relocated by rename");
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "rename failed, falling back to copy");
                relocate_by_copy(temp_path, final_path).await
            }
        }
    }

    /// Delete the staged source. Deleting an already-deleted source is not an error.
    pub async fn discard(&self, asset: &mut SourceAsset) -> Result<(), StorageError> {
        if asset.discarded {
            return Ok(());
        }

        match tokio::fs::remove_file(&asset.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(StorageError::DeleteFailed {
                    path: asset.path.clone(),
                    source,
                })
            }
        }

        asset.discarded = true;
        debug!(job_id = %asset.job_id, path = %asset.path.display(), "discarded staged source");
        Ok(())
    }

    /// Remove files older than `max_age` from the staging and working areas.
    ///
    /// Meant for startup, before any job runs, to clear what an interrupted
    /// process left behind. Returns the number of files removed.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize, StorageError> {
        let mut removed = 0;

        for dir in [&self.staging_dir, &self.working_dir] {
            if !dir.exists() {
                continue;
            }

            for entry in WalkDir::new(dir).min_depth(1).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }

                let is_stale = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                    .map(|age| age >= max_age)
                    .unwrap_or(false);

                if !is_stale {
                    continue;
                }

                std::fs::remove_file(entry.path()).map_err(|source| {
                    StorageError::DeleteFailed {
                        path: entry.path().to_path_buf(),
                        source,
                    }
                })?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "swept stale staging files");
        }
        Ok(removed)
    }
}

async fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| StorageError::CreateDir {
            path: path.to_path_buf(),
            source,
        })
}

/// Copy `temp_path` to `<final_path>.part`, sync it, rename it into place and
/// then remove the working copy
async fn relocate_by_copy(temp_path: &Path, final_path: &Path) -> Result<(), StorageError> {
    let relocate_err = |source| StorageError::RelocateFailed {
        from: temp_path.to_path_buf(),
        to: final_path.to_path_buf(),
        source,
    };

    let mut part_name = final_path.as_os_str().to_owned();
    part_name.push(".part");
    let partial = PartialFile::new(PathBuf::from(part_name));

    let mut source = tokio::fs::File::open(temp_path).await.map_err(relocate_err)?;
    write_synced(&mut source, partial.path())
        .await
        .map_err(relocate_err)?;
    tokio::fs::rename(partial.path(), final_path)
        .await
        .map_err(relocate_err)?;
    partial.keep();

    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        warn!(path = %temp_path.display(), error = %e, "relocated, but working copy remains");
    }

    debug!(from = %temp_path.display(), to = %final_path.display(), "relocated by copy");
    Ok(())
}

/// Copy `reader` into a new file at `path` and fsync it
async fn write_synced<R>(reader: &mut R, path: &Path) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut file = tokio::fs::File::create(path).await?;
    let bytes = tokio::io::copy(reader, &mut file).await?;
    file.sync_all().await?;
    Ok(bytes)
}

fn sanitize_component(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

fn staged_extension(original_name: &str) -> String {
    Path::new(original_name)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::task::{Context, Poll};
    use tempfile::TempDir;
    use tokio::io::ReadBuf;

    fn manager(root: &Path) -> StagingManager {
        StagingManager::new(
            root.join("staging"),
            root.join("encode"),
            root.join("videos"),
        )
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "connection reset")))
        }
    }

    #[tokio::test]
    async fn test_stage_writes_complete_file() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());

        let mut asset = staging
            .stage(Upload::from_bytes("job-1", "holiday.MKV", b"video bytes".to_vec()))
            .await
            .unwrap();

        assert_eq!(asset.job_id(), "job-1");
        assert_eq!(asset.size_bytes(), 11);
        assert_eq!(asset.resolution(), None);
        assert_eq!(fs::read(asset.path()).unwrap(), b"video bytes");
        assert!(asset.path().to_string_lossy().ends_with(".mkv"));

        let staged = files_in(staging.staging_dir());
        assert_eq!(staged.len(), 1, "no .part file should remain");

        staging.discard(&mut asset).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_failure_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());

        let result = staging
            .stage(Upload::from_reader("job-2", "clip.mp4", FailingReader))
            .await;

        assert!(matches!(result, Err(StorageError::StageFailed { .. })));
        assert!(files_in(staging.staging_dir()).is_empty());
    }

    #[tokio::test]
    async fn test_stage_into_unwritable_location_fails() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let staging = StagingManager::new(blocker.join("staging"), blocker.clone(), blocker.clone());

        let result = staging
            .stage(Upload::from_bytes("job-3", "clip.mp4", b"x".to_vec()))
            .await;
        assert!(matches!(result, Err(StorageError::CreateDir { .. })));
    }

    #[tokio::test]
    async fn test_stage_sanitizes_job_id() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());

        let mut asset = staging
            .stage(Upload::from_bytes("../../etc/passwd", "noext", b"x".to_vec()))
            .await
            .unwrap();

        assert_eq!(asset.path().parent().unwrap(), staging.staging_dir());
        let name = asset.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("etcpasswd_"));
        assert!(name.ends_with(".bin"));
        staging.discard(&mut asset).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_twice_is_ok() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let mut asset = staging
            .stage(Upload::from_bytes("job-4", "a.mp4", b"x".to_vec()))
            .await
            .unwrap();

        staging.discard(&mut asset).await.unwrap();
        assert!(asset.is_discarded());
        assert!(!asset.path().exists());
        staging.discard(&mut asset).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_tolerates_externally_removed_file() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let mut asset = staging
            .stage(Upload::from_bytes("job-5", "a.mp4", b"x".to_vec()))
            .await
            .unwrap();

        fs::remove_file(asset.path()).unwrap();
        staging.discard(&mut asset).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_asset_is_removed() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let asset = staging
            .stage(Upload::from_bytes("job-6", "a.mp4", b"x".to_vec()))
            .await
            .unwrap();
        let path = asset.path().to_path_buf();

        drop(asset);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_working_dir_is_idempotent_under_races() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());

        let (a, b) = tokio::join!(staging.working_dir(), staging.working_dir());
        assert_eq!(a.unwrap(), b.unwrap());
        assert!(staging.working_dir().await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_relocate_moves_file() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let working = staging.working_dir().await.unwrap();

        let temp_path = working.join("tok_720p.mp4");
        fs::write(&temp_path, b"rendition").unwrap();
        let final_path = staging.output_path("tok_720p.mp4");

        staging.relocate(&temp_path, &final_path).await.unwrap();

        assert!(!temp_path.exists());
        assert_eq!(fs::read(&final_path).unwrap(), b"rendition");
        assert!(files_in(staging.output_dir())
            .iter()
            .all(|p| !p.to_string_lossy().ends_with(".part")));
    }

    #[tokio::test]
    async fn test_relocate_by_copy_moves_file() {
        let temp = TempDir::new().unwrap();
        let working = temp.path().join("encode");
        let output = temp.path().join("videos");
        fs::create_dir_all(&working).unwrap();
        fs::create_dir_all(&output).unwrap();

        let temp_path = working.join("tok_1080p.mp4");
        let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(&temp_path, &payload).unwrap();
        let final_path = output.join("tok_1080p.mp4");

        relocate_by_copy(&temp_path, &final_path).await.unwrap();

        assert!(!temp_path.exists());
        assert_eq!(fs::read(&final_path).unwrap(), payload);
        assert!(files_in(&output)
            .iter()
            .all(|p| !p.to_string_lossy().ends_with(".part")));
    }

    #[tokio::test]
    async fn test_relocate_by_copy_failure_leaves_no_part() {
        let temp = TempDir::new().unwrap();
        let output = temp.path().join("videos");
        fs::create_dir_all(&output).unwrap();
        let final_path = output.join("tok_720p.mp4");

        let result = relocate_by_copy(&temp.path().join("gone.mp4"), &final_path).await;

        assert!(matches!(result, Err(StorageError::RelocateFailed { .. })));
        assert!(!final_path.exists());
        assert!(files_in(&output).is_empty());
    }

    #[tokio::test]
    async fn test_relocate_missing_source_fails() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());

        let result = staging
            .relocate(&temp.path().join("missing.mp4"), &staging.output_path("x.mp4"))
            .await;
        assert!(matches!(result, Err(StorageError::MissingSource(_))));
    }

    #[tokio::test]
    async fn test_relocate_unwritable_destination_fails() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let temp_path = temp.path().join("out.mp4");
        fs::write(&temp_path, b"rendition").unwrap();

        let blocker = temp.path().join("blocker");
        fs::write(&blocker, b"file").unwrap();

        let result = staging.relocate(&temp_path, &blocker.join("out.mp4")).await;
        assert!(result.is_err());
        assert!(temp_path.exists(), "working copy must survive a failed move");
    }

    #[tokio::test]
    async fn test_sweep_stale_removes_old_files_only() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        let working = staging.working_dir().await.unwrap();
        fs::create_dir_all(staging.staging_dir()).unwrap();
        fs::write(working.join("left_over.mp4"), b"x").unwrap();
        fs::write(staging.staging_dir().join("old.part"), b"x").unwrap();

        assert_eq!(staging.sweep_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(staging.sweep_stale(Duration::ZERO).unwrap(), 2);
        assert!(files_in(&working).is_empty());
    }

    #[test]
    fn test_sweep_stale_without_directories() {
        let temp = TempDir::new().unwrap();
        let staging = manager(temp.path());
        assert_eq!(staging.sweep_stale(Duration::ZERO).unwrap(), 0);
    }

    #[test]
    fn test_partial_file_guard() {
        let temp = TempDir::new().unwrap();
        let dropped = temp.path().join("dropped");
        let kept = temp.path().join("kept");
        fs::write(&dropped, b"x").unwrap();
        fs::write(&kept, b"x").unwrap();

        drop(PartialFile::new(dropped.clone()));
        PartialFile::new(kept.clone()).keep();

        assert!(!dropped.exists());
        assert!(kept.exists());
    }
}
