//! Durable entry store + render cache for banwatch.
//!
//! The entry store is an append-only map from ban entry to first-seen
//! timestamp, kept in a single JSON file written with temp-file + atomic
//! rename. The render cache holds the last rendered page body keyed by a
//! content hash of the snapshot that produced it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use banwatch_core::{BanSnapshot, EntryRecord};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

pub const CRATE_NAME: &str = "banwatch-store";

const ENTRY_STORE_FILE: &str = "bans.json";
const RENDER_CACHE_FILE: &str = "render.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Durable mapping from ban entry to first-seen timestamp.
///
/// `first_seen` is immutable once set: upserts on a present entry are no-ops,
/// so replaying the same batch is always safe.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get_all(&self) -> Result<HashMap<String, i64>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Inserts the record if absent. Returns true if inserted, false if the
    /// entry was already present (existing timestamp left untouched).
    async fn upsert_if_absent(&self, entry: &str, first_seen: i64) -> Result<bool, StoreError>;

    /// Batch variant. Returns the number of records actually inserted.
    async fn upsert_if_absent_batch(&self, records: &[EntryRecord]) -> Result<usize, StoreError> {
        let mut inserted = 0;
        for record in records {
            if self.upsert_if_absent(&record.entry, record.first_seen).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

/// JSON-file-backed entry store. A single writer mutex serializes mutations;
/// every write lands via temp file + atomic rename so a crash never leaves a
/// torn file behind.
#[derive(Debug)]
pub struct FileEntryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEntryStore {
    /// Opens the store inside `cache_dir`, creating the directory if needed.
    pub async fn open(cache_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let cache_dir = cache_dir.as_ref();
        fs::create_dir_all(cache_dir).await?;
        Ok(Self {
            path: cache_dir.join(ENTRY_STORE_FILE),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<BTreeMap<String, i64>, StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn persist(&self, entries: &BTreeMap<String, i64>) -> Result<(), StoreError> {
        write_json_atomic(&self.path, entries).await
    }
}

#[async_trait]
impl EntryStore for FileEntryStore {
    async fn get_all(&self) -> Result<HashMap<String, i64>, StoreError> {
        Ok(self.load().await?.into_iter().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.load().await?.len())
    }

    async fn upsert_if_absent(&self, entry: &str, first_seen: i64) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        if entries.contains_key(entry) {
            return Ok(false);
        }
        entries.insert(entry.to_string(), first_seen);
        self.persist(&entries).await?;
        Ok(true)
    }

    async fn upsert_if_absent_batch(&self, records: &[EntryRecord]) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.load().await?;
        let mut inserted = 0;
        for record in records {
            if !entries.contains_key(&record.entry) {
                entries.insert(record.entry.clone(), record.first_seen);
                inserted += 1;
            }
        }
        // One rewrite for the whole batch; zero insertions means zero writes.
        if inserted > 0 {
            self.persist(&entries).await?;
        }
        Ok(inserted)
    }
}

/// In-memory entry store with the same semantics, for tests and ephemeral
/// deployments.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: Mutex<HashMap<String, i64>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: &[EntryRecord]) {
        let mut entries = self.entries.lock().await;
        for record in records {
            entries
                .entry(record.entry.clone())
                .or_insert(record.first_seen);
        }
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get_all(&self) -> Result<HashMap<String, i64>, StoreError> {
        Ok(self.entries.lock().await.clone())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.entries.lock().await.len())
    }

    async fn upsert_if_absent(&self, entry: &str, first_seen: i64) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(entry) {
            return Ok(false);
        }
        entries.insert(entry.to_string(), first_seen);
        Ok(true)
    }

    async fn upsert_if_absent_batch(&self, records: &[EntryRecord]) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().await;
        let mut inserted = 0;
        for record in records {
            if !entries.contains_key(&record.entry) {
                entries.insert(record.entry.clone(), record.first_seen);
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Stable content hash of a snapshot, covering `banned` (order-sensitive),
/// the new set (sorted) and the cache timestamp. The fetch timestamp is
/// excluded: an unchanged upstream list must hash identically across fetches
/// or the render cache would never hit.
pub fn snapshot_hash(snapshot: &BanSnapshot) -> String {
    let mut new_sorted = snapshot.newly_banned.clone();
    new_sorted.sort_unstable();
    let canonical = serde_json::json!({
        "banned": snapshot.banned,
        "new": new_sorted,
        "cacheTimestamp": snapshot.cache_timestamp,
    });
    // json! builds a BTreeMap-backed object, so key order is deterministic.
    sha256_hex(canonical.to_string().as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CachedRender {
    pub body: String,
    pub snapshot_hash: String,
}

#[derive(Debug, Error)]
pub enum RenderCacheError {
    #[error("render cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("render cache serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Single-slot cache of the last rendered page body. Optionally persisted to
/// the cache directory so a restart can serve the previous render before the
/// first reconciliation completes. All persistence failures are non-fatal:
/// falling back to always-render is a safe degradation.
#[derive(Debug)]
pub struct RenderCache {
    slot: RwLock<Option<CachedRender>>,
    persist_path: Option<PathBuf>,
}

impl RenderCache {
    pub fn in_memory() -> Self {
        Self {
            slot: RwLock::new(None),
            persist_path: None,
        }
    }

    /// Persistent cache backed by `render.json` inside `cache_dir`. A missing
    /// or unreadable file just starts the cache empty.
    pub async fn persistent(cache_dir: impl AsRef<Path>) -> Self {
        let path = cache_dir.as_ref().join(RENDER_CACHE_FILE);
        let slot = match Self::load_from(&path).await {
            Ok(render) => render,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "render cache load failed, starting empty");
                None
            }
        };
        Self {
            slot: RwLock::new(slot),
            persist_path: Some(path),
        }
    }

    async fn load_from(path: &Path) -> Result<Option<CachedRender>, RenderCacheError> {
        match fs::read_to_string(path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get(&self) -> Option<CachedRender> {
        self.slot.read().await.clone()
    }

    /// True if there is no cached render or its hash does not match the
    /// snapshot's.
    pub async fn is_stale(&self, snapshot: &BanSnapshot) -> bool {
        let hash = snapshot_hash(snapshot);
        match self.slot.read().await.as_ref() {
            Some(render) => render.snapshot_hash != hash,
            None => true,
        }
    }

    pub async fn put(&self, render: CachedRender) {
        if let Some(path) = &self.persist_path {
            if let Err(err) = write_json_atomic(path, &render).await {
                let err = RenderCacheError::from(err);
                warn!(path = %path.display(), error = %err, "render cache persist failed");
            }
        }
        *self.slot.write().await = Some(render);
    }
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, &bytes).await?;
    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err.into())
        }
    }
}

impl From<StoreError> for RenderCacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(io) => RenderCacheError::Io(io),
            StoreError::Serde(serde) => RenderCacheError::Serde(serde),
        }
    }
}
