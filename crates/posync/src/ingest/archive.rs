//! Archive download, extraction and scratch cleanup
//!
//! Every archive of a chunk is downloaded concurrently into the scratch
//! directory, then extracted with a separate, smaller concurrency cap. Each
//! extraction root is owned by a [`ScratchDir`] that removes it when the
//! folder's processing ends, on every exit path.

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use posync_common::{Result, SyncError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, instrument, warn};

use super::discovery::{object_file_name, PendingArchive};
use crate::storage::ObjectStore;

/// An archive file sitting in the scratch directory
#[derive(Debug)]
pub struct DownloadedArchive {
    pub archive: PendingArchive,
    pub path: PathBuf,
}

/// An extracted archive; its root is removed when this value is cleaned up
/// or dropped
#[derive(Debug)]
pub struct ExtractedArchive {
    pub archive: PendingArchive,
    root: ScratchDir,
}

impl ExtractedArchive {
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub async fn cleanup(self) {
        self.root.remove().await;
    }
}

/// Directory removed on `remove().await` or, failing that, on drop
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    armed: bool,
}

impl ScratchDir {
    pub fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.armed = false;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed extraction root"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove extraction root"
            ),
        }
    }
}

// Only reached when `remove()` was skipped (a panic or a dropped future);
// blocks the current worker thread.
impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.path) {
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to remove extraction root on drop"
                );
            }
        }
    }
}

pub struct ArchivePipeline {
    objects: Arc<dyn ObjectStore>,
    bucket: String,
    scratch_dir: PathBuf,
    extract_concurrency: usize,
}

impl ArchivePipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        bucket: impl Into<String>,
        scratch_dir: PathBuf,
        extract_concurrency: usize,
    ) -> Self {
        Self {
            objects,
            bucket: bucket.into(),
            scratch_dir,
            extract_concurrency: extract_concurrency.max(1),
        }
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub async fn prepare_scratch(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_dir).await?;
        Ok(())
    }

    /// Download every archive of a chunk at once; failures are logged and
    /// left out of the result
    pub async fn download_batch(&self, archives: Vec<PendingArchive>) -> Vec<DownloadedArchive> {
        let total = archives.len();
        info!(count = total, "Downloading archives");

        let results = join_all(archives.into_iter().map(|archive| async move {
            match self.download(&archive.key).await {
                Ok(path) => Some(DownloadedArchive { archive, path }),
                Err(e) => {
                    error!(key = %archive.key, error = %e, "Failed to download archive");
                    None
                }
            }
        }))
        .await;

        let downloaded: Vec<DownloadedArchive> = results.into_iter().flatten().collect();
        info!(downloaded = downloaded.len(), total, "Download batch complete");
        downloaded
    }

    /// Stream one object into `<scratch>/<final key segment>`
    #[instrument(skip(self))]
    pub async fn download(&self, key: &str) -> Result<PathBuf> {
        let target = self.scratch_dir.join(object_file_name(key));

        let result = async {
            let body = self.objects.get(&self.bucket, key).await?;
            let mut reader = body.into_async_read();
            let mut file = tokio::fs::File::create(&target).await?;
            let bytes = tokio::io::copy(&mut reader, &mut file)
                .await
                .map_err(|e| SyncError::Transfer(format!("get {key}: {e}")))?;
            file.flush().await?;
            Ok::<u64, SyncError>(bytes)
        }
        .await;

        match result {
            Ok(bytes) => {
                info!(path = %target.display(), bytes, "Downloaded archive");
                Ok(target)
            }
            Err(e) => {
                remove_file_quietly(&target).await;
                Err(e)
            }
        }
    }

    /// Extract downloaded archives with bounded concurrency
    ///
    /// The archive file is deleted afterwards whether extraction worked or
    /// not. Failed archives produce no extraction root.
    pub async fn extract_batch(&self, downloaded: Vec<DownloadedArchive>) -> Vec<ExtractedArchive> {
        let total = downloaded.len();

        let extracted: Vec<ExtractedArchive> = stream::iter(downloaded)
            .map(|archive| async move {
                let key = archive.archive.key.clone();
                match self.extract(archive).await {
                    Ok(extracted) => Some(extracted),
                    Err(e) => {
                        error!(key = %key, error = %e, "Failed to extract archive");
                        None
                    }
                }
            })
            .buffer_unordered(self.extract_concurrency)
            .filter_map(|result| async move { result })
            .collect()
            .await;

        info!(
            extracted = extracted.len(),
            total,
            concurrency = self.extract_concurrency,
            "Extraction batch complete"
        );
        extracted
    }

    #[instrument(skip(self, downloaded), fields(archive_id = %downloaded.archive.archive_id))]
    async fn extract(&self, downloaded: DownloadedArchive) -> Result<ExtractedArchive> {
        let DownloadedArchive { archive, path } = downloaded;
        let root = ScratchDir::new(self.scratch_dir.join(&archive.archive_id));

        let result: Result<usize> = async {
            if tokio::fs::try_exists(root.path()).await? {
                warn!(path = %root.path().display(), "Removing stale extraction root");
                tokio::fs::remove_dir_all(root.path()).await?;
            }
            tokio::fs::create_dir_all(root.path()).await?;

            info!(
                archive = %path.display(),
                target = %root.path().display(),
                "Extracting archive"
            );

            let source = path.clone();
            let target = root.path().to_path_buf();
            tokio::task::spawn_blocking(move || extract_zip(&source, &target))
                .await
                .map_err(|e| SyncError::Extraction(format!("extraction task failed: {e}")))?
        }
        .await;

        remove_file_quietly(&path).await;

        result.map(|files| {
            info!(files, "Extraction complete");
            ExtractedArchive { archive, root }
        })
    }
}

/// Unpack a zip file into `target`; returns the number of entries
pub fn extract_zip(source: &Path, target: &Path) -> Result<usize> {
    let file = std::fs::File::open(source)?;
    let mut zip = zip::ZipArchive::new(file)
        .map_err(|e| SyncError::Extraction(format!("{}: {e}", source.display())))?;
    let entries = zip.len();
    zip.extract(target)
        .map_err(|e| SyncError::Extraction(format!("{}: {e}", source.display())))?;
    Ok(entries)
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Deleted archive file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!(path = %path.display(), error = %e, "Failed to delete archive file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_zip(path: &Path, files: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_zip() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("batch.zip");
        write_zip(&source, &[("m.csv", b"x"), ("inv.pdf", b"%PDF")]);

        let target = dir.path().join("batch");
        let count = extract_zip(&source, &target).unwrap();

        assert_eq!(count, 2);
        assert!(target.join("inv.pdf").exists());
    }

    #[test]
    fn test_extract_zip_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("broken.zip");
        std::fs::write(&source, b"not a zip").unwrap();

        let err = extract_zip(&source, &dir.path().join("broken")).unwrap_err();
        assert_eq!(err.kind(), "extraction");
    }

    #[tokio::test]
    async fn test_scratch_dir_removed_on_drop() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("batch");
        std::fs::create_dir_all(root.join("nested")).unwrap();

        drop(ScratchDir::new(root.clone()));
        assert!(!root.exists());

        std::fs::create_dir_all(&root).unwrap();
        ScratchDir::new(root.clone()).remove().await;
        assert!(!root.exists());
    }
}
