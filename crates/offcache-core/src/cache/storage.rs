//! The set of named caches shared by every foreground context.
//!
//! All mutation happens behind one `RwLock`, so a reader never observes a
//! half-migrated set. When a snapshot directory is configured, each named
//! cache is written to `<name>.cache.json` and the current-cache mapping to
//! `index.json`. Snapshots are taken after the write lock is released, so
//! disk I/O never holds up lookups.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::entry::{CacheEntry, RequestKey};
use crate::error::CacheError;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRole {
    /// Pre-warmed at install time
    Static,
    /// Filled at runtime by the router
    Dynamic,
}

impl CacheRole {
    pub const ALL: [CacheRole; 2] = [CacheRole::Static, CacheRole::Dynamic];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRole::Static => "static",
            CacheRole::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for CacheRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedCache {
    pub name: String,
    pub role: CacheRole,
    pub version: String,
    pub entries: HashMap<RequestKey, CacheEntry>,
}

impl NamedCache {
    pub fn new(name: impl Into<String>, role: CacheRole, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            version: version.into(),
            entries: HashMap::new(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.payload.len() as u64).sum()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    current: BTreeMap<CacheRole, String>,
}

#[derive(Debug, Default)]
pub struct CacheSet {
    caches: BTreeMap<String, NamedCache>,
    current: BTreeMap<CacheRole, String>,
}

impl CacheSet {
    pub fn get(&self, name: &str) -> Option<&NamedCache> {
        self.caches.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NamedCache> {
        self.caches.get_mut(name)
    }

    pub fn insert(&mut self, cache: NamedCache) {
        self.caches.insert(cache.name.clone(), cache);
    }

    pub fn remove(&mut self, name: &str) -> Option<NamedCache> {
        self.caches.remove(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.caches.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedCache> {
        self.caches.values()
    }

    /// The cache currently serving `role`, if any
    pub fn current(&self, role: CacheRole) -> Option<&NamedCache> {
        self.current.get(&role).and_then(|name| self.caches.get(name))
    }

    pub fn current_name(&self, role: CacheRole) -> Option<&str> {
        self.current.get(&role).map(String::as_str)
    }

    /// Make `name` the single current cache for `role`
    pub fn set_current(&mut self, role: CacheRole, name: &str) {
        self.current.insert(role, name.to_string());
    }

    pub fn is_current(&self, name: &str) -> bool {
        self.current.values().any(|n| n == name)
    }
}

pub struct CacheStorage {
    set: RwLock<CacheSet>,
    dir: Option<PathBuf>,
    /// Serializes snapshot writers so the newest state is always written last
    flushing: Mutex<()>,
}

impl CacheStorage {
    /// Caches that live only as long as the process
    pub fn in_memory() -> Self {
        Self {
            set: RwLock::new(CacheSet::default()),
            dir: None,
            flushing: Mutex::new(()),
        }
    }

    /// Load snapshots from `dir`, starting empty if they are missing or unreadable.
    pub async fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let set = match load_snapshot(&dir).await {
            Ok(set) => set,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Cache snapshot unreadable, starting empty");
                CacheSet::default()
            }
        };
        Self {
            set: RwLock::new(set),
            dir: Some(dir),
            flushing: Mutex::new(()),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, CacheSet> {
        self.set.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, CacheSet> {
        self.set.write().await
    }

    /// Write the named caches and the index to the snapshot directory, and
    /// remove snapshot files for caches that were deleted.
    ///
    /// Call after releasing the write guard. The snapshot reflects the set
    /// as it is when this flush gets its turn, which is never older than the
    /// change that requested it.
    pub async fn flush(&self, changed: &[&str], removed: &[String]) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let _turn = self.flushing.lock().await;

        let (caches, gone, index) = {
            let set = self.set.read().await;
            let caches: Vec<NamedCache> = changed.iter().filter_map(|n| set.get(n).cloned()).collect();
            // a name re-created since removal keeps its file
            let gone: Vec<&String> = removed.iter().filter(|n| set.get(n).is_none()).collect();
            let index = CacheIndex {
                current: set.current.clone(),
            };
            (caches, gone, index)
        };

        fs::create_dir_all(dir).await?;
        for cache in &caches {
            write_atomic(&cache_path(dir, &cache.name), &serde_json::to_vec(cache)?).await?;
        }
        for name in &gone {
            match fs::remove_file(cache_path(dir, name)).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        write_atomic(&dir.join(INDEX_FILE), &serde_json::to_vec_pretty(&index)?).await?;
        debug!(changed = caches.len(), removed = gone.len(), "Cache snapshot written");
        Ok(())
    }
}

fn cache_path(dir: &Path, name: &str) -> PathBuf {
    let safe: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!("{}.cache.json", safe))
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CacheError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_snapshot(dir: &Path) -> Result<CacheSet, CacheError> {
    let mut set = CacheSet::default();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(set),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_cache = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(".cache.json"))
            .unwrap_or(false);
        if !is_cache {
            continue;
        }
        let contents = fs::read(&path).await?;
        match serde_json::from_slice::<NamedCache>(&contents) {
            Ok(cache) => set.insert(cache),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache snapshot"),
        }
    }

    match fs::read(dir.join(INDEX_FILE)).await {
        Ok(contents) => {
            let index: CacheIndex = serde_json::from_slice(&contents)?;
            // Drop pointers to caches whose snapshot did not load
            set.current = index
                .current
                .into_iter()
                .filter(|(_, name)| set.caches.contains_key(name))
                .collect();
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    Ok(set)
}
