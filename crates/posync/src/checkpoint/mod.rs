//! Checkpoint persistence
//!
//! The store is a plain key-value surface: point lookup of archive records,
//! partition query of item records by archive, and full-record overwrites.
//! Nothing here is conditional; last writer wins.

use async_trait::async_trait;
use posync_common::Result;
use tracing::{debug, error};

use crate::models::{ArchiveRecord, ItemRecord};

pub mod postgres;

pub use postgres::PgCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Existing record, `Ok(None)` when absent, `StoreUnavailable` when the
    /// store could not answer. Callers must not treat the error as absence.
    async fn get_archive(&self, archive_id: &str) -> Result<Option<ArchiveRecord>>;

    /// All item records of one archive; empty for an archive with no items yet
    async fn list_items(&self, archive_id: &str) -> Result<Vec<ItemRecord>>;

    async fn upsert_archive(&self, record: &ArchiveRecord) -> Result<()>;

    async fn upsert_item(&self, record: &ItemRecord) -> Result<()>;

    /// Overwrite many item records at once; empty input is a no-op
    async fn batch_upsert_items(&self, records: &[ItemRecord]) -> Result<()>;

    /// Best-effort archive write: failures are logged, never raised
    async fn save_archive(&self, record: &ArchiveRecord) -> bool {
        match self.upsert_archive(record).await {
            Ok(()) => {
                debug!(
                    archive_id = %record.archive_id,
                    completed = record.completed,
                    "Archive checkpoint saved"
                );
                true
            }
            Err(e) => {
                error!(
                    archive_id = %record.archive_id,
                    error = %e,
                    "Failed to save archive checkpoint"
                );
                false
            }
        }
    }

    /// Best-effort item write: failures are logged, never raised
    async fn save_item(&self, record: &ItemRecord) -> bool {
        match self.upsert_item(record).await {
            Ok(()) => {
                debug!(
                    archive_id = %record.archive_id,
                    file = %record.file_name,
                    status = %record.status,
                    "Item checkpoint saved"
                );
                true
            }
            Err(e) => {
                error!(
                    archive_id = %record.archive_id,
                    file = %record.file_name,
                    error = %e,
                    "Failed to save item checkpoint"
                );
                false
            }
        }
    }

    /// Best-effort batch write: failures are logged, never raised
    async fn save_items(&self, records: &[ItemRecord]) -> bool {
        if records.is_empty() {
            debug!("No item checkpoints to save");
            return true;
        }

        match self.batch_upsert_items(records).await {
            Ok(()) => {
                debug!(count = records.len(), "Item checkpoints saved");
                true
            }
            Err(e) => {
                error!(count = records.len(), error = %e, "Failed to save item checkpoints");
                false
            }
        }
    }
}
