//! Sweep orchestration
//!
//! Discovery → chunking → per chunk (strictly one after another):
//! download → extract → per folder {parse → upload → roll up} → cleanup.
//!
//! Folders of one chunk run concurrently. A folder failure never stops its
//! siblings; once every folder of the chunk has finished and been cleaned up,
//! the failures are raised together as a chunk error, logged, and the sweep
//! moves on to the next chunk.

use futures::future::join_all;
use posync_common::{Result, SyncError};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

use super::archive::{ArchivePipeline, ExtractedArchive};
use super::discovery::{chunk, ArchiveDiscovery, PendingArchive};
use super::stats::{SyncStats, UploadSummary};
use super::upload::UploadOrchestrator;
use crate::checkpoint::CheckpointStore;
use crate::config::SyncSettings;
use crate::manifest::ManifestParser;
use crate::storage::ObjectStore;

/// Outcome of one processed folder
#[derive(Debug, Clone)]
pub struct FolderReport {
    pub archive_id: String,
    pub summary: UploadSummary,
    pub completed: bool,
    pub error: Option<String>,
}

pub struct SyncOrchestrator {
    checkpoints: Arc<dyn CheckpointStore>,
    discovery: ArchiveDiscovery,
    archives: ArchivePipeline,
    uploads: UploadOrchestrator,
    parser: ManifestParser,
    chunk_size: usize,
}

impl SyncOrchestrator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bucket: &str,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            discovery: ArchiveDiscovery::new(
                Arc::clone(&objects),
                Arc::clone(&checkpoints),
                bucket,
                &settings.archive_suffix,
            ),
            archives: ArchivePipeline::new(
                Arc::clone(&objects),
                bucket,
                settings.scratch_dir.clone(),
                settings.extract_concurrency,
            ),
            uploads: UploadOrchestrator::new(
                objects,
                Arc::clone(&checkpoints),
                bucket,
                &settings.destination_prefix,
                &settings.content_type,
                settings.upload_concurrency,
            ),
            parser: settings.manifest_parser(),
            checkpoints,
            chunk_size: settings.chunk_size.max(1),
        }
    }

    /// Run one full sweep
    ///
    /// Only failures outside every chunk boundary (the scratch directory
    /// cannot be created) are returned; everything else is logged and
    /// counted in the returned stats.
    pub async fn run(&self) -> Result<SyncStats> {
        let mut stats = SyncStats::new();
        let started = Instant::now();

        self.archives.prepare_scratch().await?;
        info!(scratch = %self.archives.scratch_dir().display(), "Starting sync");

        let pending = self.discovery.discover().await;
        stats.archives_discovered = pending.len();

        let chunks = chunk(pending, self.chunk_size);
        let total = chunks.len();

        for (index, archives) in chunks.into_iter().enumerate() {
            info!(
                chunk = index + 1,
                total,
                archives = archives.len(),
                "Processing chunk"
            );

            stats.chunks_processed += 1;
            if let Err(e) = self.run_chunk(archives, &mut stats).await {
                stats.chunks_failed += 1;
                error!(
                    chunk = index + 1,
                    kind = e.kind(),
                    error = %e,
                    "Chunk failed, continuing with next"
                );
            }
        }

        stats.mark_completed(self.uploads.metrics());

        info!(
            discovered = stats.archives_discovered,
            chunks = stats.chunks_processed,
            chunks_failed = stats.chunks_failed,
            extracted = stats.archives_extracted,
            completed = stats.archives_completed,
            uploaded = stats.uploads.uploaded,
            failed = stats.uploads.failed,
            missing = stats.uploads.missing,
            invalid_routing_key = stats.uploads.invalid_routing_key,
            avg_transfer_ms = stats.avg_transfer_ms,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "Sync complete"
        );

        Ok(stats)
    }

    /// Download, extract and process one chunk of archives
    pub async fn run_chunk(
        &self,
        archives: Vec<PendingArchive>,
        stats: &mut SyncStats,
    ) -> Result<Vec<FolderReport>> {
        let downloaded = self.archives.download_batch(archives).await;
        stats.archives_downloaded += downloaded.len();

        let extracted = self.archives.extract_batch(downloaded).await;
        stats.archives_extracted += extracted.len();

        let results = join_all(extracted.into_iter().map(|folder| async move {
            let archive_id = folder.archive.archive_id.clone();
            let result = self.process_folder(&folder).await;
            folder.cleanup().await;
            (archive_id, result)
        }))
        .await;

        let mut reports = Vec::with_capacity(results.len());
        let mut failures = Vec::new();

        for (archive_id, result) in results {
            match result {
                Ok(report) => {
                    stats.uploads.merge(&report.summary);
                    if report.completed {
                        stats.archives_completed += 1;
                    }
                    reports.push(report);
                }
                Err(e) => {
                    stats.folders_failed += 1;
                    error!(
                        archive_id = %archive_id,
                        kind = e.kind(),
                        retry_next_run = e.is_transient(),
                        error = %e,
                        "Folder processing failed"
                    );
                    failures.push(format!("{archive_id}: {e}"));
                }
            }
        }

        if failures.is_empty() {
            Ok(reports)
        } else {
            Err(SyncError::Chunk(failures.join("; ")))
        }
    }

    /// Parse manifests, upload routed attachments and roll the archive up
    #[instrument(skip(self, folder), fields(archive_id = %folder.archive.archive_id))]
    pub async fn process_folder(&self, folder: &ExtractedArchive) -> Result<FolderReport> {
        let archive_id = folder.archive.archive_id.as_str();

        let parsed = self.parser.parse_folder(folder.root()).await?;
        let diagnostic = parsed.diagnostic();

        let summary = if parsed.routing.is_empty() {
            info!("No routed attachments in archive");
            UploadSummary::default()
        } else {
            let known = self.checkpoints.list_items(archive_id).await?;
            self.uploads
                .upload_archive(archive_id, &parsed.routing, folder.root(), known)
                .await
        };

        let items = self.checkpoints.list_items(archive_id).await?;
        let mut record = folder.archive.record.clone();
        record.roll_up(&items, diagnostic);
        self.checkpoints.save_archive(&record).await;

        match (&record.error, record.completed) {
            (None, true) => info!(items = items.len(), "Archive completed"),
            (Some(problem), true) => warn!(
                items = items.len(),
                problem = %problem,
                "Archive completed with manifest problems"
            ),
            (_, false) => {
                let open = items.iter().filter(|item| !item.completed).count();
                warn!(items = items.len(), open, "Archive not yet complete");
            }
        }

        Ok(FolderReport {
            archive_id: archive_id.to_string(),
            summary,
            completed: record.completed,
            error: record.error,
        })
    }
}
