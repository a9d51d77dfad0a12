//! posync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error taxonomy and logging setup for the posync workspace.
//!
//! - **Error Handling**: [`SyncError`] and the [`Result`] alias
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]

pub mod error;
pub mod logging;

pub use error::{Result, SyncError};
