//! Two-tier store: a durable backend with a volatile in-process fallback.
//!
//! Callers see one contract. When the durable backend cannot be opened, or
//! fails with an I/O-class error, the store degrades to the fallback for the
//! rest of the process lifetime and logs the switch once. Whatever the
//! durable backend can still read is carried into the fallback at that point.
//! Durability is lost in that mode; the contract is not.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::backend::{StoreBackend, StoreRecord};
use super::file::FileBackend;
use super::memory::MemoryBackend;
use crate::error::StoreError;

/// Per-key locks so unrelated keys never serialize behind each other.
/// An entry lives only while someone holds or waits on it.
#[derive(Default)]
pub(super) struct KeyLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one keyed operation
pub(super) struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(super) async fn acquire(&self, key: &str) -> KeyGuard<'_> {
        let lock = self.table().entry(key.to_string()).or_default().clone();
        KeyGuard {
            owner: self,
            key: key.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.table().len()
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut table = self.owner.table();
        if table.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            table.remove(&self.key);
        }
    }
}

pub struct DurableStore {
    primary: Option<Arc<dyn StoreBackend>>,
    fallback: MemoryBackend,
    /// Set once the durable records have been copied into `fallback`
    carried_over: OnceCell<()>,
    degraded: AtomicBool,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    pub(super) locks: KeyLocks,
}

impl DurableStore {
    /// Open a file-backed store, degrading to memory if the directory is unusable.
    pub async fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        match FileBackend::open(&dir).await {
            Ok(backend) => Self::with_backend(Arc::new(backend)).await,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Durable store unavailable, using in-memory fallback");
                Self::volatile()
            }
        }
    }

    /// Wrap an already-open backend, seeding `last_sync` from its records.
    pub async fn with_backend(backend: Arc<dyn StoreBackend>) -> Self {
        let store = Self {
            primary: Some(backend),
            fallback: MemoryBackend::new(),
            carried_over: OnceCell::new(),
            degraded: AtomicBool::new(false),
            last_sync: RwLock::new(None),
            locks: KeyLocks::default(),
        };
        store.seed_last_sync().await;
        store
    }

    /// A store with no durable backend at all
    pub fn volatile() -> Self {
        Self {
            primary: None,
            fallback: MemoryBackend::new(),
            carried_over: OnceCell::new(),
            degraded: AtomicBool::new(true),
            last_sync: RwLock::new(None),
            locks: KeyLocks::default(),
        }
    }

    /// True once writes are no longer reaching a durable backend
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub fn backend_name(&self) -> &'static str {
        match self.active_primary() {
            Some(primary) => primary.name(),
            None => self.fallback.name(),
        }
    }

    /// Timestamp of the most recent successful `put`
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read().await
    }

    pub async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_record(key).await?.map(|r| r.value))
    }

    pub async fn get_record(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        let _guard = self.locks.acquire(key).await;
        self.read_record(key).await
    }

    /// Store `value` under `key`. `updated_at` never moves backwards for a key.
    pub async fn put(&self, key: &str, value: Value) -> Result<StoreRecord, StoreError> {
        let _guard = self.locks.acquire(key).await;
        let previous = self.read_record(key).await?;
        self.write_value(key, value, previous.as_ref()).await
    }

    /// Read-modify-write under the key's lock.
    pub async fn update<F>(&self, key: &str, f: F) -> Result<StoreRecord, StoreError>
    where
        F: FnOnce(Option<Value>) -> Result<Value, StoreError>,
    {
        let _guard = self.locks.acquire(key).await;
        let previous = self.read_record(key).await?;
        let value = f(previous.as_ref().map(|r| r.value.clone()))?;
        self.write_value(key, value, previous.as_ref()).await
    }

    /// Delete a record. This is the only way records are removed.
    pub async fn drop_key(&self, key: &str) -> Result<bool, StoreError> {
        let _guard = self.locks.acquire(key).await;
        if let Some(primary) = self.active_primary() {
            match primary.remove(key).await {
                Ok(existed) => return Ok(existed),
                Err(e) => self.degrade(&e),
            }
        }
        self.fallback().await.remove(key).await
    }

    pub async fn keys(&self) -> Result<Vec<String>, StoreError> {
        if let Some(primary) = self.active_primary() {
            match primary.keys().await {
                Ok(keys) => return Ok(keys),
                Err(e) => self.degrade(&e),
            }
        }
        self.fallback().await.keys().await
    }

    // ===== Tier selection =====

    fn active_primary(&self) -> Option<&Arc<dyn StoreBackend>> {
        if self.is_degraded() {
            None
        } else {
            self.primary.as_ref()
        }
    }

    fn degrade(&self, cause: &StoreError) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            warn!(error = %cause, "Durable store failed, switching to in-memory fallback");
        }
    }

    /// The in-memory tier, seeded from the durable backend on first use
    async fn fallback(&self) -> &MemoryBackend {
        self.carried_over.get_or_init(|| self.carry_over()).await;
        &self.fallback
    }

    /// Copy every record the durable backend can still read. Writes may have
    /// started failing while reads still work.
    async fn carry_over(&self) {
        let Some(primary) = &self.primary else {
            return;
        };
        let keys = match primary.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "Durable records unreadable, fallback starts empty");
                return;
            }
        };

        let mut copied = 0usize;
        for key in keys {
            match primary.read(&key).await {
                Ok(Some(record)) => {
                    if self.fallback.write(&record).await.is_ok() {
                        copied += 1;
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(key = %key, error = %e, "Record not carried over"),
            }
        }
        info!(copied, "Durable records carried into in-memory fallback");
    }

    pub(super) async fn read_record(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        if let Some(primary) = self.active_primary() {
            match primary.read(key).await {
                Ok(record) => return Ok(record),
                // A single unreadable record is lost, not the whole backend
                Err(StoreError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Discarding corrupt record");
                    return Ok(None);
                }
                Err(e) => self.degrade(&e),
            }
        }
        self.fallback().await.read(key).await
    }

    pub(super) async fn write_value(
        &self,
        key: &str,
        value: Value,
        previous: Option<&StoreRecord>,
    ) -> Result<StoreRecord, StoreError> {
        let now = Utc::now();
        let updated_at = match previous {
            Some(prev) if prev.updated_at > now => prev.updated_at,
            _ => now,
        };
        let record = StoreRecord {
            key: key.to_string(),
            value,
            updated_at,
        };

        let mut written = false;
        if let Some(primary) = self.active_primary() {
            match primary.write(&record).await {
                Ok(()) => written = true,
                Err(e) => self.degrade(&e),
            }
        }
        if !written {
            self.fallback().await.write(&record).await?;
        }

        let mut last_sync = self.last_sync.write().await;
        if last_sync.map_or(true, |t| record.updated_at > t) {
            *last_sync = Some(record.updated_at);
        }
        debug!(key = %key, backend = self.backend_name(), "Record written");
        Ok(record)
    }

    async fn seed_last_sync(&self) {
        let keys = match self.keys().await {
            Ok(keys) => keys,
            Err(e) => {
                debug!(error = %e, "Could not list records to seed last sync");
                return;
            }
        };

        let mut latest: Option<DateTime<Utc>> = None;
        for key in keys {
            if let Ok(Some(record)) = self.read_record(&key).await {
                if latest.map_or(true, |t| record.updated_at > t) {
                    latest = Some(record.updated_at);
                }
            }
        }

        if latest.is_some() {
            info!(last_sync = ?latest, "Durable store opened with existing records");
        }
        *self.last_sync.write().await = latest;
    }
}
