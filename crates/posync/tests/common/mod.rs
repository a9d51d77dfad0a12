//! Shared test utilities for posync integration tests
//!
//! - [`MemoryObjectStore`]: paged in-memory bucket with put concurrency
//!   counters and failure injection
//! - [`MemoryCheckpointStore`]: in-memory checkpoint tables with outage
//!   injection
//! - zip and manifest fixture builders
//! - [`TestPostgres`]: Postgres container with migrations applied
#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use posync::checkpoint::CheckpointStore;
use posync::config::SyncSettings;
use posync::ingest::{SyncOrchestrator, SyncStats};
use posync::models::{ArchiveRecord, ItemKey, ItemRecord};
use posync::storage::{ListPage, ObjectEntry, ObjectStore};
use posync::SyncError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;

pub const TEST_BUCKET: &str = "archives";

pub const MANIFEST_HEADER: &str = "Id~Claim Number~PO Number~Attachment List~Comments";

/// Initialize tracing for tests
pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,posync=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Object store double
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    page_size: usize,
    put_delay: Duration,
    failing_puts: Mutex<HashSet<String>>,
    fail_list_after: Mutex<Option<usize>>,
    puts: Mutex<Vec<String>>,
    gets: AtomicUsize,
    list_calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::with_page_size(1000)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            ..Default::default()
        }
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects
            .lock()
            .unwrap()
            .insert((TEST_BUCKET.to_string(), key.to_string()), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(TEST_BUCKET.to_string(), key.to_string()))
            .cloned()
    }

    pub fn fail_put(&self, key: &str) {
        self.failing_puts.lock().unwrap().insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing_puts.lock().unwrap().clear();
        *self.fail_list_after.lock().unwrap() = None;
    }

    /// Fail every listing call after `pages` successful pages
    pub fn fail_list_after(&self, pages: usize) {
        *self.fail_list_after.lock().unwrap() = Some(pages);
    }

    /// Destination keys of successful puts, in completion order
    pub fn put_keys(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(&self, bucket: &str, continuation: Option<String>) -> posync::Result<ListPage> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_list_after.lock().unwrap() {
            if call >= limit {
                return Err(SyncError::Transfer("list: connection reset".into()));
            }
        }

        let offset: usize = match continuation {
            Some(token) => token
                .parse()
                .map_err(|_| SyncError::Transfer(format!("bad continuation token {token}")))?,
            None => 0,
        };

        let objects = self.objects.lock().unwrap();
        let all: Vec<ObjectEntry> = objects
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, key), data)| ObjectEntry {
                key: key.clone(),
                size: data.len() as i64,
            })
            .collect();

        let end = (offset + self.page_size).min(all.len());
        let entries = all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < all.len()).then(|| end.to_string());

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> posync::Result<ByteStream> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let data = self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| SyncError::Transfer(format!("get {key}: NoSuchKey")))?;
        Ok(ByteStream::from(data))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        _content_type: &str,
    ) -> posync::Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.put_delay.is_zero() {
            tokio::time::sleep(self.put_delay).await;
        }

        let result = async {
            if self.failing_puts.lock().unwrap().contains(key) {
                return Err(SyncError::Transfer(format!("put {key}: AccessDenied")));
            }
            let data = body
                .collect()
                .await
                .map_err(|e| SyncError::Transfer(e.to_string()))?
                .into_bytes()
                .to_vec();
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), data);
            self.puts.lock().unwrap().push(key.to_string());
            Ok(())
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

// ============================================================================
// Checkpoint store double
// ============================================================================

#[derive(Default)]
pub struct MemoryCheckpointStore {
    archives: Mutex<HashMap<String, ArchiveRecord>>,
    items: Mutex<BTreeMap<ItemKey, ItemRecord>>,
    unavailable_archives: Mutex<HashSet<String>>,
    failing_item_lists: Mutex<HashSet<String>>,
    failing_item_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make lookups of one archive fail as if the store were unreachable
    pub fn make_unavailable(&self, archive_id: &str) {
        self.unavailable_archives
            .lock()
            .unwrap()
            .insert(archive_id.to_string());
    }

    /// Make item queries of one archive fail
    pub fn fail_list_items(&self, archive_id: &str) {
        self.failing_item_lists
            .lock()
            .unwrap()
            .insert(archive_id.to_string());
    }

    /// Make single-item upserts fail
    pub fn fail_item_writes(&self, failing: bool) {
        self.failing_item_writes.store(failing, Ordering::SeqCst);
    }

    pub fn archive(&self, archive_id: &str) -> Option<ArchiveRecord> {
        self.archives.lock().unwrap().get(archive_id).cloned()
    }

    pub fn items(&self, archive_id: &str) -> Vec<ItemRecord> {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.archive_id == archive_id)
            .cloned()
            .collect()
    }

    pub fn item(&self, archive_id: &str, file_name: &str) -> Option<ItemRecord> {
        self.items
            .lock()
            .unwrap()
            .get(&ItemKey::new(archive_id, file_name))
            .cloned()
    }

    pub fn all_archives(&self) -> Vec<ArchiveRecord> {
        self.archives.lock().unwrap().values().cloned().collect()
    }

    pub fn all_items(&self) -> Vec<ItemRecord> {
        self.items.lock().unwrap().values().cloned().collect()
    }

}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get_archive(&self, archive_id: &str) -> posync::Result<Option<ArchiveRecord>> {
        if self.unavailable_archives.lock().unwrap().contains(archive_id) {
            return Err(SyncError::StoreUnavailable("throttled".into()));
        }
        Ok(self.archive(archive_id))
    }

    async fn list_items(&self, archive_id: &str) -> posync::Result<Vec<ItemRecord>> {
        if self.failing_item_lists.lock().unwrap().contains(archive_id) {
            return Err(SyncError::StoreUnavailable("read timeout".into()));
        }
        Ok(self.items(archive_id))
    }

    async fn upsert_archive(&self, record: &ArchiveRecord) -> posync::Result<()> {
        self.archives
            .lock()
            .unwrap()
            .insert(record.archive_id.clone(), record.clone());
        Ok(())
    }

    async fn upsert_item(&self, record: &ItemRecord) -> posync::Result<()> {
        if self.failing_item_writes.load(Ordering::SeqCst) {
            return Err(SyncError::StoreUnavailable("write throttled".into()));
        }
        self.items
            .lock()
            .unwrap()
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn batch_upsert_items(&self, records: &[ItemRecord]) -> posync::Result<()> {
        let mut items = self.items.lock().unwrap();
        for record in records {
            items.insert(record.key(), record.clone());
        }
        Ok(())
    }
}

/// Assert the two checkpoint invariants over everything stored
pub fn assert_checkpoint_invariants(store: &MemoryCheckpointStore) {
    let items = store.all_items();
    for item in &items {
        if item.completed {
            assert!(item.error.is_none(), "completed item with error: {item:?}");
        }
    }

    for archive in store.all_archives() {
        let own: Vec<&ItemRecord> = items
            .iter()
            .filter(|item| item.archive_id == archive.archive_id)
            .collect();
        if archive.completed {
            assert!(
                own.iter().all(|item| item.completed),
                "completed archive {} has open items",
                archive.archive_id
            );
        }
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Zip archive bytes holding `files`
pub fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Manifest text with one line per `(po number, attachment list)`
pub fn manifest(rows: &[(&str, &str)]) -> String {
    let mut text = String::from(MANIFEST_HEADER);
    text.push('\n');
    for (idx, (po, attachments)) in rows.iter().enumerate() {
        text.push_str(&format!("{}~{}~{po}~{attachments}~\n", idx + 1, 1000 + idx));
    }
    text
}

/// Zip with a `manifest.csv` plus a stub PDF for every name in `present`
pub fn archive_with(rows: &[(&str, &str)], present: &[&str]) -> Vec<u8> {
    let manifest = manifest(rows);
    let mut files: Vec<(&str, &[u8])> = vec![("manifest.csv", manifest.as_bytes())];
    for name in present {
        files.push((name, b"%PDF-1.4 stub"));
    }
    build_zip(&files)
}

// ============================================================================
// Pipeline harness
// ============================================================================

pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub settings: SyncSettings,
    scratch: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_objects(MemoryObjectStore::new())
    }

    pub fn with_objects(objects: MemoryObjectStore) -> Self {
        let scratch = TempDir::new().unwrap();
        let settings = SyncSettings {
            scratch_dir: scratch.path().join("Extracted"),
            ..SyncSettings::default()
        };

        Self {
            objects: Arc::new(objects),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            settings,
            scratch,
        }
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.objects.clone(),
            self.checkpoints.clone(),
            TEST_BUCKET,
            &self.settings,
        )
    }

    pub async fn run(&self) -> SyncStats {
        self.orchestrator().run().await.unwrap()
    }

    /// Entries left in the scratch directory after a run
    pub fn scratch_entries(&self) -> Vec<String> {
        match std::fs::read_dir(&self.settings.scratch_dir) {
            Ok(dir) => dir
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

// ============================================================================
// PostgreSQL Test Container
// ============================================================================

pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    /// Start a PostgreSQL container with migrations applied
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;

        let connection_string = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&connection_string)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
