//! Operator commands over checkpoints
//!
//! Missing and invalid-routing-key items resolve as complete and are never
//! retried by a sweep on their own. [`requeue`] re-opens them (or failed
//! items) so the next sweep picks the archive up again.

use chrono::Utc;
use posync_common::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::models::{ArchiveRecord, ItemRecord, ItemStatus};

/// Which items of an archive to re-open
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RequeueFilter {
    Missing,
    InvalidPo,
    Error,
    /// Missing and invalid-routing-key items
    AllFlagged,
}

impl RequeueFilter {
    pub fn matches(&self, status: ItemStatus) -> bool {
        match self {
            RequeueFilter::Missing => status == ItemStatus::Missing,
            RequeueFilter::InvalidPo => status == ItemStatus::InvalidPo,
            RequeueFilter::Error => status == ItemStatus::Error,
            RequeueFilter::AllFlagged => status.is_flagged(),
        }
    }
}

/// Re-open matching items and the archive; returns how many items changed
pub async fn requeue(
    checkpoints: &dyn CheckpointStore,
    archive_id: &str,
    filter: RequeueFilter,
) -> Result<usize> {
    let mut selected: Vec<ItemRecord> = checkpoints
        .list_items(archive_id)
        .await?
        .into_iter()
        .filter(|item| filter.matches(item.status))
        .collect();

    for item in &mut selected {
        item.reopen();
    }
    checkpoints.batch_upsert_items(&selected).await?;

    let mut archive = checkpoints
        .get_archive(archive_id)
        .await?
        .unwrap_or_else(|| ArchiveRecord::new(archive_id));
    archive.completed = false;
    archive.last_updated = Utc::now();
    checkpoints.upsert_archive(&archive).await?;

    info!(
        archive_id,
        filter = ?filter,
        items = selected.len(),
        "Archive requeued"
    );
    Ok(selected.len())
}

/// Checkpoint snapshot of one archive
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveStatus {
    pub archive: Option<ArchiveRecord>,
    pub items: usize,
    pub open: usize,
    pub by_status: BTreeMap<String, usize>,
}

pub async fn archive_status(checkpoints: &dyn CheckpointStore, archive_id: &str) -> Result<ArchiveStatus> {
    let archive = checkpoints.get_archive(archive_id).await?;
    let items = checkpoints.list_items(archive_id).await?;

    let mut by_status = BTreeMap::new();
    for item in &items {
        *by_status.entry(item.status.to_string()).or_insert(0) += 1;
    }

    Ok(ArchiveStatus {
        archive,
        items: items.len(),
        open: items.iter().filter(|item| !item.completed).count(),
        by_status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches() {
        assert!(RequeueFilter::AllFlagged.matches(ItemStatus::Missing));
        assert!(RequeueFilter::AllFlagged.matches(ItemStatus::InvalidPo));
        assert!(!RequeueFilter::AllFlagged.matches(ItemStatus::Error));
        assert!(RequeueFilter::Error.matches(ItemStatus::Error));
        assert!(!RequeueFilter::Missing.matches(ItemStatus::Successful));
    }
}
