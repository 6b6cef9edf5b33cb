use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use reqwest::Url;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, RequestKey};
use super::storage::{CacheRole, CacheStorage, NamedCache};
use crate::error::{CacheError, NetworkError};
use crate::http::{Fetcher, Request, Response};

/// Owns this version's view of the shared cache set.
///
/// Cache names are `<prefix>-<role>-<version>`, so bumping the version is
/// the only thing that causes eviction on the next activation.
pub struct CacheManager {
    prefix: String,
    version: String,
    origin: Url,
    storage: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Duration,
}

/// Shape of one named cache, for diagnostics
#[derive(Debug, Clone)]
pub struct CacheSummary {
    pub name: String,
    pub role: CacheRole,
    pub version: String,
    pub current: bool,
    pub entries: usize,
    pub size_bytes: u64,
    pub newest_age: Option<String>,
}

impl CacheManager {
    pub fn new(
        prefix: impl Into<String>,
        version: impl Into<String>,
        origin: Url,
        storage: Arc<CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
            origin,
            storage,
            fetcher,
            fetch_timeout,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn cache_name(&self, role: CacheRole) -> String {
        format!("{}-{}-{}", self.prefix, role, self.version)
    }

    /// Resolve a configured asset (absolute or origin-relative) to a same-origin URL
    pub fn resolve_asset(&self, asset: &str) -> Result<Url, CacheError> {
        let url = self
            .origin
            .join(asset)
            .map_err(|_| CacheError::InvalidUrl(asset.to_string()))?;
        if url.origin() != self.origin.origin() {
            return Err(CacheError::InvalidUrl(asset.to_string()));
        }
        Ok(url)
    }

    /// Pre-warm this version's static cache.
    ///
    /// All assets are fetched before anything is written; any failure leaves
    /// the cache set untouched. Returns the number of entries stored.
    pub async fn install(&self, assets: &[String]) -> Result<usize, CacheError> {
        let name = self.cache_name(CacheRole::Static);
        info!(cache = %name, assets = assets.len(), "Installing static cache");

        let urls = assets
            .iter()
            .map(|a| self.resolve_asset(a))
            .collect::<Result<Vec<_>, _>>()?;

        let fetches = urls.into_iter().map(|url| self.fetch_for_install(url));
        let fetched = try_join_all(fetches).await?;

        let mut cache = NamedCache::new(&name, CacheRole::Static, &self.version);
        for (key, response) in fetched {
            cache
                .entries
                .insert(key.clone(), CacheEntry::from_response(key, &response));
        }
        let count = cache.entries.len();

        self.storage.write().await.insert(cache);
        self.storage.flush(&[name.as_str()], &[]).await?;

        info!(cache = %name, entries = count, "Static cache installed");
        Ok(count)
    }

    async fn fetch_for_install(&self, url: Url) -> Result<(RequestKey, Response), CacheError> {
        let request = Request::get(url.clone());
        let response = match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                return Err(CacheError::InstallFetch {
                    url: url.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(CacheError::InstallFetch {
                    url: url.to_string(),
                    source: NetworkError::Timeout(self.fetch_timeout),
                })
            }
        };

        if !response.is_success() {
            return Err(CacheError::InstallStatus {
                url: url.to_string(),
                status: response.status,
            });
        }
        Ok((RequestKey::get(&url), response))
    }

    /// Promote this version's caches to current and delete every other cache.
    ///
    /// Returns the number of caches removed. Running it again with nothing
    /// stale removes nothing. The swap is committed in memory as one step; a
    /// snapshot failure afterwards is logged and does not undo it.
    pub async fn activate(&self) -> Result<usize, CacheError> {
        let static_name = self.cache_name(CacheRole::Static);
        let dynamic_name = self.cache_name(CacheRole::Dynamic);

        let stale = self.swap_current(&static_name, &dynamic_name).await?;
        if let Err(e) = self
            .storage
            .flush(&[static_name.as_str(), dynamic_name.as_str()], &stale)
            .await
        {
            warn!(version = %self.version, error = %e, "Failed to persist activation");
        }

        info!(version = %self.version, removed = stale.len(), "Caches activated");
        Ok(stale.len())
    }

    async fn swap_current(&self, static_name: &str, dynamic_name: &str) -> Result<Vec<String>, CacheError> {
        let mut set = self.storage.write().await;
        if set.get(static_name).is_none() {
            return Err(CacheError::NotInstalled(self.version.clone()));
        }
        if set.get(dynamic_name).is_none() {
            set.insert(NamedCache::new(dynamic_name, CacheRole::Dynamic, &self.version));
        }
        set.set_current(CacheRole::Static, static_name);
        set.set_current(CacheRole::Dynamic, dynamic_name);

        let stale: Vec<String> = set
            .names()
            .filter(|name| *name != static_name && *name != dynamic_name)
            .map(str::to_string)
            .collect();
        for name in &stale {
            debug!(cache = %name, "Deleting superseded cache");
            set.remove(name);
        }
        Ok(stale)
    }

    /// Whether this version's static cache is the current one
    pub async fn is_active(&self) -> bool {
        let set = self.storage.read().await;
        set.current_name(CacheRole::Static) == Some(self.cache_name(CacheRole::Static).as_str())
    }

    /// Find a cached response in the current caches, static first.
    pub async fn lookup(&self, key: &RequestKey) -> Option<CacheEntry> {
        let set = self.storage.read().await;
        CacheRole::ALL
            .iter()
            .filter_map(|role| set.current(*role))
            .find_map(|cache| cache.entries.get(key).cloned())
    }

    pub async fn lookup_in(&self, role: CacheRole, key: &RequestKey) -> Option<CacheEntry> {
        let set = self.storage.read().await;
        set.current(role).and_then(|c| c.entries.get(key).cloned())
    }

    /// Write a runtime response into this version's dynamic cache.
    pub async fn store(&self, key: RequestKey, entry: CacheEntry) -> Result<(), CacheError> {
        if !key.as_str().starts_with("GET ") {
            return Err(CacheError::NonGet(key.to_string()));
        }

        let name = self.cache_name(CacheRole::Dynamic);
        {
            let mut set = self.storage.write().await;
            if set.get(&name).is_none() {
                set.insert(NamedCache::new(&name, CacheRole::Dynamic, &self.version));
            }
            if let Some(cache) = set.get_mut(&name) {
                cache.entries.insert(key, entry);
            }
        }

        if let Err(e) = self.storage.flush(&[name.as_str()], &[]).await {
            // The in-memory entry still serves this process
            warn!(cache = %name, error = %e, "Failed to persist dynamic cache");
        }
        Ok(())
    }

    /// Remove one entry from the current dynamic cache
    pub async fn evict(&self, key: &RequestKey) -> Result<bool, CacheError> {
        let name = self.cache_name(CacheRole::Dynamic);
        let removed = self
            .storage
            .write()
            .await
            .get_mut(&name)
            .map(|c| c.entries.remove(key).is_some())
            .unwrap_or(false);
        if removed {
            self.storage.flush(&[name.as_str()], &[]).await?;
        }
        Ok(removed)
    }

    pub async fn summaries(&self) -> Vec<CacheSummary> {
        let set = self.storage.read().await;
        set.iter()
            .map(|cache| CacheSummary {
                name: cache.name.clone(),
                role: cache.role,
                version: cache.version.clone(),
                current: set.is_current(&cache.name),
                entries: cache.entries.len(),
                size_bytes: cache.size_bytes(),
                newest_age: cache
                    .entries
                    .values()
                    .max_by_key(|e| e.stored_at)
                    .map(|e| e.age_display()),
            })
            .collect()
    }
}
