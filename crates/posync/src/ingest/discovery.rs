//! Discovery of unfinished archives

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::models::ArchiveRecord;
use crate::storage::ObjectStore;

/// An archive object that still has work left
#[derive(Debug, Clone, PartialEq)]
pub struct PendingArchive {
    pub key: String,
    pub archive_id: String,
    pub size: i64,
    pub record: ArchiveRecord,
}

/// Archive identifier of an object key: its final path segment without the
/// extension
pub fn archive_id(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name.to_string(),
    }
}

/// Final path segment of an object key
pub fn object_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Split `items` into consecutive groups of `size`, keeping order
pub fn chunk<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }
    chunks
}

pub struct ArchiveDiscovery {
    objects: Arc<dyn ObjectStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    bucket: String,
    archive_suffix: String,
}

impl ArchiveDiscovery {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bucket: impl Into<String>,
        archive_suffix: impl Into<String>,
    ) -> Self {
        Self {
            objects,
            checkpoints,
            bucket: bucket.into(),
            archive_suffix: archive_suffix.into(),
        }
    }

    /// List archives and keep the ones not yet completed, in listing order
    ///
    /// New archives get a fresh checkpoint persisted right away. An archive
    /// whose checkpoint cannot be read is skipped for this run. A listing
    /// failure ends discovery with whatever was found before it.
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    pub async fn discover(&self) -> Vec<PendingArchive> {
        info!("Fetching archives to process");

        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        let mut listing = self.objects.list_all(&self.bucket, &self.archive_suffix);

        while let Some(entry) = listing.next().await {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!(error = %e, found = pending.len(), "Archive listing failed");
                    break;
                }
            };

            // Checkpoints and scratch paths are keyed by identifier, so the
            // first key producing an identifier wins.
            let id = archive_id(&entry.key);
            if !seen.insert(id.clone()) {
                debug!(key = %entry.key, archive_id = %id, "Archive already queued, ignoring");
                continue;
            }

            let record = match self.checkpoints.get_archive(&id).await {
                Ok(Some(record)) if record.completed => {
                    debug!(archive_id = %id, "Archive already completed");
                    continue;
                }
                Ok(Some(record)) => record,
                Ok(None) => {
                    let record = ArchiveRecord::new(&id);
                    self.checkpoints.save_archive(&record).await;
                    record
                }
                Err(e) => {
                    warn!(
                        archive_id = %id,
                        error = %e,
                        "Checkpoint unavailable, skipping archive this run"
                    );
                    continue;
                }
            };

            info!(key = %entry.key, size = entry.size, "Adding archive for processing");
            pending.push(PendingArchive {
                key: entry.key,
                archive_id: id,
                size: entry.size,
                record,
            });
        }

        if pending.is_empty() {
            info!("No archives to process");
        } else {
            info!(count = pending.len(), "Archive discovery complete");
        }

        pending
    }
}
