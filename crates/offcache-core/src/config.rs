//! Worker configuration.
//!
//! Stored as JSON at `~/.config/offcache/config.json`. Missing fields take
//! their defaults, and `OFFCACHE_ORIGIN`, `OFFCACHE_VERSION` and
//! `OFFCACHE_DATA_DIR` override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "offcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const MIN_FETCH_TIMEOUT_SECS: u64 = 5;
const MAX_FETCH_TIMEOUT_SECS: u64 = 10;

pub const ENV_ORIGIN: &str = "OFFCACHE_ORIGIN";
pub const ENV_VERSION: &str = "OFFCACHE_VERSION";
pub const ENV_DATA_DIR: &str = "OFFCACHE_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Origin the worker serves; requests elsewhere pass through
    pub origin: String,
    pub cache_prefix: String,
    /// Embedded in cache names; changing it evicts on next activation
    pub version: String,
    /// Same-origin URLs pre-warmed into the static cache
    pub assets: Vec<String>,
    pub root_document: String,
    pub fetch_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            origin: "http://localhost:8080/".to_string(),
            cache_prefix: APP_NAME.to_string(),
            version: "v1".to_string(),
            assets: vec!["/".to_string()],
            root_document: "/".to_string(),
            fetch_timeout_secs: 8,
            sync_interval_secs: 300,
            data_dir: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&contents)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoDirectory("config"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from `lookup`, normally the process environment.
    /// Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(origin) = lookup(ENV_ORIGIN) {
            self.origin = origin;
        }
        if let Some(version) = lookup(ENV_VERSION) {
            self.version = version;
        }
        if let Some(dir) = lookup(ENV_DATA_DIR) {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn origin_url(&self) -> Result<Url, ConfigError> {
        let url =
            Url::parse(&self.origin).map_err(|_| ConfigError::InvalidOrigin(self.origin.clone()))?;
        if url.cannot_be_a_base() {
            return Err(ConfigError::InvalidOrigin(self.origin.clone()));
        }
        Ok(url)
    }

    /// The root document resolved against the origin. Must stay same-origin.
    pub fn root_document_url(&self) -> Result<Url, ConfigError> {
        let origin = self.origin_url()?;
        let url = origin
            .join(&self.root_document)
            .map_err(|_| ConfigError::InvalidRootDocument(self.root_document.clone()))?;
        if url.origin() != origin.origin() {
            return Err(ConfigError::InvalidRootDocument(self.root_document.clone()));
        }
        Ok(url)
    }

    /// Router fallback timeout, clamped to 5..=10 seconds
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(
            self.fetch_timeout_secs
                .clamp(MIN_FETCH_TIMEOUT_SECS, MAX_FETCH_TIMEOUT_SECS),
        )
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn data_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let data_dir = dirs::data_dir().ok_or(ConfigError::NoDirectory("data"))?;
                Ok(data_dir.join(APP_NAME))
            }
        }
    }

    pub fn store_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.data_dir()?.join("store"))
    }

    pub fn cache_dir(&self) -> Result<PathBuf, ConfigError> {
        let cache_dir = dirs::cache_dir().ok_or(ConfigError::NoDirectory("cache"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn cache_snapshot_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.cache_dir()?.join("caches"))
    }

    pub fn log_dir(&self) -> Result<PathBuf, ConfigError> {
        Ok(self.cache_dir()?.join("logs"))
    }
}
