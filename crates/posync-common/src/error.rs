//! Error types for posync

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for posync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failure taxonomy shared by every pipeline stage.
///
/// Per-item variants (`Transfer`, `LocalFileMissing`, `InvalidRoutingKey`) are
/// recorded on the item checkpoint and never escape an upload task. `Parse`
/// skips one manifest file. `Chunk` abandons one chunk of archives while the
/// sweep continues with the next.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Checkpoint store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Local file missing: {}", .0.display())]
    LocalFileMissing(PathBuf),

    #[error("Invalid routing key for {0}")]
    InvalidRoutingKey(String),

    #[error("Parse error in {file}: {message}")]
    Parse { file: String, message: String },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Chunk error: {0}")]
    Chunk(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    pub fn parse(file: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Parse {
            file: file.into(),
            message: message.to_string(),
        }
    }

    /// Short, stable name for structured log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::StoreUnavailable(_) => "store_unavailable",
            SyncError::Transfer(_) => "transfer",
            SyncError::LocalFileMissing(_) => "local_file_missing",
            SyncError::InvalidRoutingKey(_) => "invalid_routing_key",
            SyncError::Parse { .. } => "parse",
            SyncError::Extraction(_) => "extraction",
            SyncError::Chunk(_) => "chunk",
            SyncError::Io(_) => "io",
        }
    }

    /// Whether a later run may succeed without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::Transfer(_) | SyncError::Io(_)
        )
    }
}
