use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A value stored under a logical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRecord {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

/// Raw key/value persistence underneath `DurableStore`.
///
/// Backends do no locking of their own beyond what a single call needs;
/// `DurableStore` serializes access per key.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn read(&self, key: &str) -> Result<Option<StoreRecord>, StoreError>;

    async fn write(&self, record: &StoreRecord) -> Result<(), StoreError>;

    /// Returns whether a record existed
    async fn remove(&self, key: &str) -> Result<bool, StoreError>;

    async fn keys(&self) -> Result<Vec<String>, StoreError>;
}
