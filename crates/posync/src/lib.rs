//! posync library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Resumable sweep of document archives from an S3 bucket into a layout keyed
//! by purchase-order number.
//!
//! # Overview
//!
//! Each archive holds one or more `~`-delimited manifests and the attachment
//! files they list. A sweep finds archives that are not yet complete, extracts
//! them chunk by chunk, routes every listed document to
//! `<prefix>/<po number>/<file>` and records the outcome of every file in the
//! checkpoint store, so a rerun after a crash only redoes unfinished work.
//!
//! - **checkpoint**: archive and item checkpoints ([`checkpoint::CheckpointStore`], Postgres backend)
//! - **storage**: object store access ([`storage::ObjectStore`], S3 backend)
//! - **manifest**: manifest schema, parsing and routing
//! - **ingest**: discovery, archive handling, uploads and the sweep orchestrator
//! - **config**: environment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use posync::{checkpoint::PgCheckpointStore, config::Config, ingest::SyncOrchestrator, storage::S3ObjectStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let objects = Arc::new(S3ObjectStore::new(&config.storage).await);
//!     let checkpoints = Arc::new(PgCheckpointStore::connect(&config.database).await?);
//!     let sync = SyncOrchestrator::new(objects, checkpoints, &config.storage.bucket, &config.sync);
//!     let stats = sync.run().await?;
//!     println!("{} archives completed", stats.archives_completed);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod ingest;
pub mod manifest;
pub mod models;
pub mod storage;

pub use posync_common::{Result, SyncError};
