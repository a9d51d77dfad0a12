//! Postgres-backed checkpoint store
//!
//! Schema (see `migrations/`):
//!
//! | table                 | key                        | index                    |
//! |-----------------------|----------------------------|--------------------------|
//! | `archive_checkpoints` | `archive_id`               |                          |
//! | `item_checkpoints`    | `(archive_id, file_name)`  | `(status, processed_at)` |
//!
//! Rows are decoded into the row structs below and converted into records
//! explicitly; item status is stored as its string form.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use posync_common::{Result, SyncError};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::CheckpointStore;
use crate::config::DatabaseConfig;
use crate::models::{ArchiveRecord, ItemKey, ItemRecord, ItemStatus};

/// Rows per multi-row upsert statement (9 binds per row)
const UPSERT_BATCH_ROWS: usize = 1000;

const ARCHIVE_COLUMNS: &str = "archive_id, last_updated, completed, error";

const ITEM_COLUMNS: &str = "archive_id, file_name, status, completed, routing_key, \
                            destination, error, warning, processed_at";

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool and optionally apply the bundled migrations
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(unavailable)?;

        info!(
            max_connections = config.max_connections,
            "Checkpoint database pool established"
        );

        let store = Self::new(pool);
        if config.run_migrations {
            store.migrate().await?;
        }
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SyncError::StoreUnavailable(format!("migrations failed: {e}")))?;

        info!("Checkpoint migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    #[instrument(skip(self))]
    async fn get_archive(&self, archive_id: &str) -> Result<Option<ArchiveRecord>> {
        let row: Option<ArchiveRow> = sqlx::query_as(&format!(
            "SELECT {ARCHIVE_COLUMNS} FROM archive_checkpoints WHERE archive_id = $1"
        ))
        .bind(archive_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(row.map(ArchiveRecord::from))
    }

    #[instrument(skip(self))]
    async fn list_items(&self, archive_id: &str) -> Result<Vec<ItemRecord>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM item_checkpoints WHERE archive_id = $1 ORDER BY file_name"
        ))
        .bind(archive_id)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        debug!(count = rows.len(), "Fetched item checkpoints");

        rows.into_iter().map(ItemRecord::try_from).collect()
    }

    #[instrument(skip(self, record), fields(archive_id = %record.archive_id))]
    async fn upsert_archive(&self, record: &ArchiveRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO archive_checkpoints ({ARCHIVE_COLUMNS})
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (archive_id) DO UPDATE
            SET last_updated = EXCLUDED.last_updated,
                completed = EXCLUDED.completed,
                error = EXCLUDED.error
            "#
        ))
        .bind(&record.archive_id)
        .bind(record.last_updated)
        .bind(record.completed)
        .bind(&record.error)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(item = %record.key()))]
    async fn upsert_item(&self, record: &ItemRecord) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO item_checkpoints ({ITEM_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            {ITEM_CONFLICT}
            "#
        ))
        .bind(&record.archive_id)
        .bind(&record.file_name)
        .bind(record.status.as_str())
        .bind(record.completed)
        .bind(&record.routing_key)
        .bind(&record.destination)
        .bind(&record.error)
        .bind(&record.warning)
        .bind(record.processed_at)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    #[instrument(skip(self, records), fields(count = records.len()))]
    async fn batch_upsert_items(&self, records: &[ItemRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        // One statement may not touch the same key twice; the last copy wins.
        let deduped: BTreeMap<ItemKey, &ItemRecord> =
            records.iter().map(|r| (r.key(), r)).collect();
        let rows: Vec<&ItemRecord> = deduped.into_values().collect();

        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        for batch in rows.chunks(UPSERT_BATCH_ROWS) {
            let mut builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO item_checkpoints ({ITEM_COLUMNS}) "));

            builder.push_values(batch, |mut b, record| {
                b.push_bind(record.archive_id.clone())
                    .push_bind(record.file_name.clone())
                    .push_bind(record.status.as_str())
                    .push_bind(record.completed)
                    .push_bind(record.routing_key.clone())
                    .push_bind(record.destination.clone())
                    .push_bind(record.error.clone())
                    .push_bind(record.warning.clone())
                    .push_bind(record.processed_at);
            });
            builder.push(ITEM_CONFLICT);

            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
        }

        tx.commit().await.map_err(unavailable)?;

        debug!(rows = rows.len(), "Batch upserted item checkpoints");
        Ok(())
    }
}

const ITEM_CONFLICT: &str = r#"
    ON CONFLICT (archive_id, file_name) DO UPDATE
    SET status = EXCLUDED.status,
        completed = EXCLUDED.completed,
        routing_key = EXCLUDED.routing_key,
        destination = EXCLUDED.destination,
        error = EXCLUDED.error,
        warning = EXCLUDED.warning,
        processed_at = EXCLUDED.processed_at
"#;

fn unavailable(err: sqlx::Error) -> SyncError {
    SyncError::StoreUnavailable(err.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct ArchiveRow {
    archive_id: String,
    last_updated: DateTime<Utc>,
    completed: bool,
    error: Option<String>,
}

impl From<ArchiveRow> for ArchiveRecord {
    fn from(row: ArchiveRow) -> Self {
        Self {
            archive_id: row.archive_id,
            last_updated: row.last_updated,
            completed: row.completed,
            error: row.error,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    archive_id: String,
    file_name: String,
    status: String,
    completed: bool,
    routing_key: Option<String>,
    destination: Option<String>,
    error: Option<String>,
    warning: Option<String>,
    processed_at: DateTime<Utc>,
}

impl TryFrom<ItemRow> for ItemRecord {
    type Error = SyncError;

    fn try_from(row: ItemRow) -> Result<Self> {
        let status: ItemStatus = row
            .status
            .parse()
            .map_err(|message| SyncError::parse("item_checkpoints", message))?;

        Ok(Self {
            archive_id: row.archive_id,
            file_name: row.file_name,
            status,
            completed: row.completed,
            routing_key: row.routing_key,
            destination: row.destination,
            error: row.error,
            warning: row.warning,
            processed_at: row.processed_at,
        })
    }
}
