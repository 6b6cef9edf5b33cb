//! Error types for every failure class the engine distinguishes.
//!
//! Store and cache failures are caught at the component boundary and turned
//! into fallback behavior; they only reach a foreground context as a
//! `CACHE_ERROR` payload. Network failures drive the router's fallback chain.
//! Protocol failures are logged and the offending message is dropped.

use std::time::Duration;

use thiserror::Error;

/// Maximum length for response bodies quoted in error messages
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Durable backend unavailable: {0}")]
    Unavailable(String),

    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Record '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Install failed fetching {url}: {source}")]
    InstallFetch {
        url: String,
        #[source]
        source: NetworkError,
    },

    #[error("Install failed: {url} responded with status {status}")]
    InstallStatus { url: String, status: u16 },

    #[error("Refusing to cache non-GET request: {0}")]
    NonGet(String),

    #[error("Invalid asset URL '{0}'")]
    InvalidUrl(String),

    #[error("Version {0} has not been installed")]
    NotInstalled(String),

    #[error("Cache snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache snapshot is malformed: {0}")]
    Snapshot(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network unreachable")]
    Offline,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            // reqwest does not expose the configured duration on the error
            NetworkError::Transport(format!("timeout: {}", e))
        } else if e.is_builder() {
            NetworkError::InvalidRequest(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Message is missing a type tag")]
    MissingType,

    #[error("Message payload is invalid: {0}")]
    InvalidPayload(String),
}

impl ProtocolError {
    /// Truncate a raw message to avoid logging excessive data
    pub fn preview(raw: &str) -> String {
        if raw.len() <= MAX_ERROR_BODY_LENGTH {
            raw.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !raw.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &raw[..end], raw.len())
        }
    }
}

/// Returned by the router when the network failed and no cached or
/// synthesized response applies.
#[derive(Error, Debug)]
pub enum RouteError {
    #[error("No cached response for {url} and the network failed: {source}")]
    Unavailable {
        url: String,
        #[source]
        source: NetworkError,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not find {0} directory")]
    NoDirectory(&'static str),

    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config file is malformed: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid origin '{0}'")]
    InvalidOrigin(String),

    #[error("Invalid root document '{0}'")]
    InvalidRootDocument(String),

    #[error("Could not build HTTP client: {0}")]
    HttpClient(#[from] NetworkError),
}

/// Lifecycle misuse or a failed cache step inside it.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Cannot {action} while the worker is {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_short_message_untouched() {
        assert_eq!(ProtocolError::preview("{}"), "{}");
    }

    #[test]
    fn test_preview_truncates_long_message() {
        let raw = "x".repeat(500);
        let preview = ProtocolError::preview(&raw);
        assert!(preview.starts_with(&"x".repeat(200)));
        assert!(preview.ends_with("(truncated, 500 total bytes)"));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let raw = "é".repeat(150);
        let preview = ProtocolError::preview(&raw);
        assert!(preview.contains("truncated"));
    }

    #[test]
    fn test_install_error_names_url() {
        let err = CacheError::InstallStatus {
            url: "https://app.test/app.js".to_string(),
            status: 404,
        };
        assert!(err.to_string().contains("app.js"));
        assert!(err.to_string().contains("404"));
    }
}
