//! Checkpoint records
//!
//! Two record kinds are persisted: one per archive and one per
//! (archive, attachment file) pair. Components work on owned copies and write
//! them back through [`crate::checkpoint::CheckpointStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Processing state of one attachment
///
/// `Processing` is the in-flight marker; every attempt ends in one of the
/// other four. Only `Error` leaves `completed == false`, so it is the only
/// status retried by the next sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemStatus {
    #[serde(rename = "processing")]
    Processing,
    #[serde(rename = "successful")]
    Successful,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "missing file")]
    Missing,
    #[serde(rename = "invalid po")]
    InvalidPo,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Processing => "processing",
            ItemStatus::Successful => "successful",
            ItemStatus::Error => "error",
            ItemStatus::Missing => "missing file",
            ItemStatus::InvalidPo => "invalid po",
        }
    }

    /// Terminal outcomes that are complete but need a human to look at them
    pub fn is_flagged(&self) -> bool {
        matches!(self, ItemStatus::Missing | ItemStatus::InvalidPo)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(ItemStatus::Processing),
            "successful" => Ok(ItemStatus::Successful),
            "error" => Ok(ItemStatus::Error),
            "missing file" => Ok(ItemStatus::Missing),
            "invalid po" => Ok(ItemStatus::InvalidPo),
            other => Err(format!("unknown item status: {other}")),
        }
    }
}

/// Archive-level checkpoint, keyed by archive identifier
///
/// `completed` holds only when every item of the archive is complete. Records
/// are created on first discovery and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub archive_id: String,
    pub last_updated: DateTime<Utc>,
    pub completed: bool,
    pub error: Option<String>,
}

impl ArchiveRecord {
    /// Fresh, incomplete record for a newly discovered archive
    pub fn new(archive_id: impl Into<String>) -> Self {
        Self {
            archive_id: archive_id.into(),
            last_updated: Utc::now(),
            completed: false,
            error: None,
        }
    }

    /// Roll the archive up from its persisted items
    ///
    /// Completion follows the items alone. `diagnostic` (manifest parse
    /// failures, no manifest at all) is recorded in `error` but never holds
    /// the archive open.
    pub fn roll_up(&mut self, items: &[ItemRecord], diagnostic: Option<String>) {
        self.completed = items.iter().all(|item| item.completed);
        self.error = diagnostic;
        self.last_updated = Utc::now();
    }
}

/// Composite key of an item record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub archive_id: String,
    pub file_name: String,
}

impl ItemKey {
    pub fn new(archive_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            archive_id: archive_id.into(),
            file_name: file_name.into(),
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.archive_id, self.file_name)
    }
}

/// Item-level checkpoint for one attachment of one archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub archive_id: String,
    pub file_name: String,
    pub status: ItemStatus,
    pub completed: bool,
    pub routing_key: Option<String>,
    pub destination: Option<String>,
    pub error: Option<String>,
    pub warning: Option<String>,
    pub processed_at: DateTime<Utc>,
}

impl ItemRecord {
    /// In-flight marker written before the first transfer attempt
    pub fn processing(archive_id: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            archive_id: archive_id.into(),
            file_name: file_name.into(),
            status: ItemStatus::Processing,
            completed: false,
            routing_key: None,
            destination: None,
            error: None,
            warning: None,
            processed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(&self.archive_id, &self.file_name)
    }

    /// Record the outcome of one attempt
    ///
    /// Blank texts collapse to `None`. `completed` follows the error alone, so
    /// warning-only outcomes (missing file, blank routing key) complete. A
    /// status still at `Processing` resolves to `Error` or `Successful`.
    pub fn resolve(
        &mut self,
        routing_key: &str,
        destination: String,
        error: Option<String>,
        warning: Option<String>,
    ) {
        self.routing_key = Some(routing_key.to_string());
        self.destination = Some(destination);
        self.error = error.filter(|e| !e.trim().is_empty());
        self.warning = warning.filter(|w| !w.trim().is_empty());
        self.completed = self.error.is_none();
        if self.status == ItemStatus::Processing {
            self.status = if self.completed {
                ItemStatus::Successful
            } else {
                ItemStatus::Error
            };
        }
        self.processed_at = Utc::now();
    }

    /// Re-open the item so the next sweep attempts it again
    pub fn reopen(&mut self) {
        self.completed = false;
        self.processed_at = Utc::now();
    }
}
