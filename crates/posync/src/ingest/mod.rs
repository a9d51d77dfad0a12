//! Archive sync pipeline
//!
//! - **discovery**: unfinished archives and chunking
//! - **archive**: download, extraction and scratch cleanup
//! - **upload**: per-item transfers with checkpointing
//! - **orchestrator**: the sweep itself
//! - **requeue**: operator commands over checkpoints
//! - **stats**: counters reported at the end of a sweep

pub mod archive;
pub mod discovery;
pub mod orchestrator;
pub mod requeue;
pub mod stats;
pub mod upload;

pub use discovery::{ArchiveDiscovery, PendingArchive};
pub use orchestrator::{FolderReport, SyncOrchestrator};
pub use requeue::{archive_status, requeue, ArchiveStatus, RequeueFilter};
pub use stats::{OperationMetrics, SyncStats, UploadSummary};
pub use upload::{destination_path, UploadOrchestrator};
