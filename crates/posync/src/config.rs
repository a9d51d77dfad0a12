//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::manifest::{ManifestParser, SuffixMatcher};
use crate::storage::StorageConfig;

// ============================================================================
// Sync Defaults
// ============================================================================

/// Folder prefix every routed attachment lands under.
pub const DEFAULT_DESTINATION_PREFIX: &str = "by-po";

/// Scratch directory name created under the system temp dir.
pub const DEFAULT_SCRATCH_DIR_NAME: &str = "Extracted";

/// Archives downloaded and processed together per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 5;

/// Concurrent extractions per chunk.
pub const DEFAULT_EXTRACT_CONCURRENCY: usize = 3;

/// Concurrent uploads per archive, across all routing keys.
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 5;

pub const DEFAULT_ARCHIVE_SUFFIX: &str = ".zip";
pub const DEFAULT_MANIFEST_SUFFIX: &str = ".csv";
pub const DEFAULT_DOCUMENT_SUFFIX: &str = ".pdf";
pub const DEFAULT_CONTENT_TYPE: &str = "application/pdf";

// ============================================================================
// Database Defaults
// ============================================================================

pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/posync";
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub sync: SyncSettings,
}

/// Checkpoint database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
            run_migrations: true,
        }
    }
}

/// Pipeline knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    pub destination_prefix: String,
    pub scratch_dir: PathBuf,
    pub chunk_size: usize,
    pub extract_concurrency: usize,
    pub upload_concurrency: usize,
    pub archive_suffix: String,
    pub manifest_suffix: String,
    pub document_suffix: String,
    /// Match manifest and document suffixes ignoring ASCII case
    pub suffix_case_insensitive: bool,
    pub content_type: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            destination_prefix: DEFAULT_DESTINATION_PREFIX.to_string(),
            scratch_dir: std::env::temp_dir().join(DEFAULT_SCRATCH_DIR_NAME),
            chunk_size: DEFAULT_CHUNK_SIZE,
            extract_concurrency: DEFAULT_EXTRACT_CONCURRENCY,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            archive_suffix: DEFAULT_ARCHIVE_SUFFIX.to_string(),
            manifest_suffix: DEFAULT_MANIFEST_SUFFIX.to_string(),
            document_suffix: DEFAULT_DOCUMENT_SUFFIX.to_string(),
            suffix_case_insensitive: false,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }
}

impl SyncSettings {
    pub fn manifest_parser(&self) -> ManifestParser {
        ManifestParser::new(
            SuffixMatcher::new(&self.manifest_suffix, self.suffix_case_insensitive),
            SuffixMatcher::new(&self.document_suffix, self.suffix_case_insensitive),
        )
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    /// Load configuration from environment and defaults, then validate
    pub fn load() -> anyhow::Result<Self> {
        let config = Self::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment and defaults without validating,
    /// so callers can apply overrides first
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let sync_defaults = SyncSettings::default();
        let db_defaults = DatabaseConfig::default();

        Ok(Config {
            storage: StorageConfig::from_env()?,
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", &db_defaults.url),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", db_defaults.max_connections),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    db_defaults.connect_timeout_secs,
                ),
                run_migrations: env_or("DATABASE_RUN_MIGRATIONS", db_defaults.run_migrations),
            },
            sync: SyncSettings {
                destination_prefix: env_string(
                    "POSYNC_DESTINATION_PREFIX",
                    &sync_defaults.destination_prefix,
                ),
                scratch_dir: std::env::var("POSYNC_SCRATCH_DIR")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or(sync_defaults.scratch_dir),
                chunk_size: env_or("POSYNC_CHUNK_SIZE", sync_defaults.chunk_size),
                extract_concurrency: env_or(
                    "POSYNC_EXTRACT_CONCURRENCY",
                    sync_defaults.extract_concurrency,
                ),
                upload_concurrency: env_or(
                    "POSYNC_UPLOAD_CONCURRENCY",
                    sync_defaults.upload_concurrency,
                ),
                archive_suffix: env_string("POSYNC_ARCHIVE_SUFFIX", &sync_defaults.archive_suffix),
                manifest_suffix: env_string(
                    "POSYNC_MANIFEST_SUFFIX",
                    &sync_defaults.manifest_suffix,
                ),
                document_suffix: env_string(
                    "POSYNC_DOCUMENT_SUFFIX",
                    &sync_defaults.document_suffix,
                ),
                suffix_case_insensitive: env_or(
                    "POSYNC_SUFFIX_CASE_INSENSITIVE",
                    sync_defaults.suffix_case_insensitive,
                ),
                content_type: env_string("POSYNC_CONTENT_TYPE", &sync_defaults.content_type),
            },
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.bucket.trim().is_empty() {
            anyhow::bail!("S3 bucket cannot be empty");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.sync.chunk_size == 0 {
            anyhow::bail!("Chunk size must be greater than 0");
        }

        if self.sync.extract_concurrency == 0 || self.sync.upload_concurrency == 0 {
            anyhow::bail!("Extract and upload concurrency must be greater than 0");
        }

        if self.sync.destination_prefix.trim_matches(['/', '\\']).is_empty() {
            anyhow::bail!("Destination prefix cannot be empty");
        }

        Ok(())
    }
}
