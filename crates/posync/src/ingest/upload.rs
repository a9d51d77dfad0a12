//! Per-item attachment transfer
//!
//! One task per attachment, all tasks of an archive sharing one semaphore so
//! at most `concurrency` transfers run at once across every routing key of
//! that archive. A task always ends by writing its item checkpoint; nothing
//! it does can fail the archive.

use aws_sdk_s3::primitives::ByteStream;
use posync_common::SyncError;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::stats::{OperationMetrics, UploadSummary};
use crate::checkpoint::CheckpointStore;
use crate::manifest::RoutingMap;
use crate::models::{ItemRecord, ItemStatus};
use crate::storage::ObjectStore;

/// Destination key `<prefix>/<routing key>/<file name>`
///
/// Backslashes become forward slashes, empty segments are dropped and a
/// routing key that already starts with the prefix does not repeat it.
pub fn destination_path(prefix: &str, routing_key: &str, file_name: &str) -> String {
    fn segments(value: &str) -> impl Iterator<Item = &str> {
        value.split(|c: char| c == '/' || c == '\\').filter(|s| !s.is_empty())
    }

    let prefix: Vec<&str> = segments(prefix).collect();
    let mut rest: Vec<&str> = segments(routing_key).chain(segments(file_name)).collect();
    if !prefix.is_empty() && rest.starts_with(&prefix) {
        rest.drain(..prefix.len());
    }

    prefix.into_iter().chain(rest).collect::<Vec<_>>().join("/")
}

/// How one item task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Uploaded,
    Failed,
    Missing,
    InvalidRoutingKey,
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    objects: Arc<dyn ObjectStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    bucket: String,
    destination_prefix: String,
    content_type: String,
    concurrency: usize,
    metrics: Arc<OperationMetrics>,
}

struct ItemJob {
    archive_id: String,
    file_name: String,
    routing_key: String,
    local_path: PathBuf,
    existing: Option<ItemRecord>,
}

impl UploadOrchestrator {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        bucket: impl Into<String>,
        destination_prefix: impl Into<String>,
        content_type: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            objects,
            checkpoints,
            bucket: bucket.into(),
            destination_prefix: destination_prefix.into(),
            content_type: content_type.into(),
            concurrency: concurrency.max(1),
            metrics: Arc::new(OperationMetrics::new()),
        }
    }

    /// Transfer timings across every archive this orchestrator handled
    pub fn metrics(&self) -> &OperationMetrics {
        &self.metrics
    }

    /// Upload every routed attachment of one extracted archive
    ///
    /// `known` is the archive's current item checkpoints. Files already
    /// completed under the same routing key are skipped, and a file name is
    /// scheduled at most once per call.
    #[instrument(skip(self, routing, root, known), fields(keys = routing.len()))]
    pub async fn upload_archive(
        &self,
        archive_id: &str,
        routing: &RoutingMap,
        root: &Path,
        known: Vec<ItemRecord>,
    ) -> UploadSummary {
        info!("Starting upload process");

        let mut summary = UploadSummary::default();
        let mut known: HashMap<String, ItemRecord> = known
            .into_iter()
            .map(|record| (record.file_name.clone(), record))
            .collect();

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut tasks = JoinSet::new();

        for (routing_key, files) in routing.iter() {
            if files.is_empty() {
                info!(routing_key, "No attachments for routing key");
                continue;
            }

            let completed: HashSet<String> = known
                .values()
                .filter(|r| r.completed && r.routing_key.as_deref() == Some(routing_key))
                .map(|r| r.file_name.clone())
                .collect();

            for file_name in files {
                if completed.contains(file_name) {
                    debug!(routing_key, file = %file_name, "Already completed, skipping");
                    summary.skipped_complete += 1;
                    continue;
                }
                if !scheduled.insert(file_name.clone()) {
                    debug!(routing_key, file = %file_name, "Already scheduled this pass, skipping");
                    summary.duplicates += 1;
                    continue;
                }

                let job = ItemJob {
                    archive_id: archive_id.to_string(),
                    file_name: file_name.clone(),
                    routing_key: routing_key.to_string(),
                    local_path: root.join(file_name),
                    existing: known.remove(file_name),
                };

                let this = self.clone();
                let semaphore = Arc::clone(&semaphore);
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|e| SyncError::Transfer(format!("upload limiter closed: {e}")))?;
                    Ok::<ItemOutcome, SyncError>(this.process_item(job).await)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => match outcome {
                    ItemOutcome::Uploaded => {
                        summary.attempted += 1;
                        summary.uploaded += 1;
                    }
                    ItemOutcome::Failed => {
                        summary.attempted += 1;
                        summary.failed += 1;
                    }
                    ItemOutcome::Missing => summary.missing += 1,
                    ItemOutcome::InvalidRoutingKey => summary.invalid_routing_key += 1,
                },
                Ok(Err(e)) => {
                    error!(error = %e, "Upload task could not start");
                    summary.aborted += 1;
                }
                Err(e) => {
                    error!(error = %e, "Upload task aborted");
                    summary.aborted += 1;
                }
            }
        }

        info!(
            uploaded = summary.uploaded,
            failed = summary.failed,
            missing = summary.missing,
            invalid_routing_key = summary.invalid_routing_key,
            skipped = summary.skipped_complete,
            "Upload process complete"
        );
        summary
    }

    async fn process_item(&self, job: ItemJob) -> ItemOutcome {
        let ItemJob {
            archive_id,
            file_name,
            routing_key,
            local_path,
            existing,
        } = job;

        let mut record = match existing {
            Some(mut record) => {
                record.status = ItemStatus::Processing;
                record
            }
            None => {
                info!(archive_id = %archive_id, file = %file_name, "Creating item checkpoint");
                let record = ItemRecord::processing(&archive_id, &file_name);
                self.checkpoints.save_item(&record).await;
                record
            }
        };

        let destination = destination_path(&self.destination_prefix, &routing_key, &file_name);
        let mut error_text = None;
        let mut warning_text = None;

        let outcome = match tokio::fs::try_exists(&local_path).await {
            Ok(true) if routing_key.trim().is_empty() => {
                record.status = ItemStatus::InvalidPo;
                let warning = SyncError::InvalidRoutingKey(file_name.clone()).to_string();
                warn!(archive_id = %archive_id, file = %file_name, "{}", warning);
                warning_text = Some(warning);
                ItemOutcome::InvalidRoutingKey
            }
            Ok(true) => match self.transfer(&local_path, &destination).await {
                Ok(()) => {
                    info!(destination = %destination, "Uploaded attachment");
                    ItemOutcome::Uploaded
                }
                Err(e) => {
                    error!(
                        archive_id = %archive_id,
                        file = %file_name,
                        kind = e.kind(),
                        retry_next_run = e.is_transient(),
                        error = %e,
                        "Failed to upload attachment"
                    );
                    error_text = Some(e.to_string());
                    ItemOutcome::Failed
                }
            },
            Err(e) => {
                error!(
                    archive_id = %archive_id,
                    file = %file_name,
                    error = %e,
                    "Could not check local attachment"
                );
                error_text = Some(format!("check {}: {e}", local_path.display()));
                ItemOutcome::Failed
            }
            Ok(false) => {
                record.status = ItemStatus::Missing;
                let warning = SyncError::LocalFileMissing(local_path.clone()).to_string();
                warn!(archive_id = %archive_id, file = %file_name, "{}", warning);
                warning_text = Some(warning);
                ItemOutcome::Missing
            }
        };

        record.resolve(&routing_key, destination, error_text, warning_text);
        self.checkpoints.save_item(&record).await;

        outcome
    }

    async fn transfer(&self, local_path: &Path, destination: &str) -> posync_common::Result<()> {
        let started = Instant::now();

        let result = async {
            let body = ByteStream::from_path(local_path).await.map_err(|e| {
                SyncError::Transfer(format!("read {}: {e}", local_path.display()))
            })?;
            self.objects
                .put(&self.bucket, destination, body, &self.content_type)
                .await
        }
        .await;

        match &result {
            Ok(()) => self.metrics.record_success(started.elapsed()),
            Err(_) => self.metrics.record_failure(started.elapsed()),
        }
        result
    }
}
