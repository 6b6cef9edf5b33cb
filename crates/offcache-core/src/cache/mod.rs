//! Versioned caches of network responses.
//!
//! This module provides the `CacheManager`, which pre-warms a "static" cache
//! at install time, promotes a version's caches at activation (deleting all
//! others), and serves lookups and runtime writes for the router.
//!
//! Cache roles:
//! - `static` - assets listed for pre-warming, filled all-or-nothing
//! - `dynamic` - responses written through by the router at runtime

pub mod entry;
pub mod manager;
pub mod storage;

pub use entry::{CacheEntry, ContentMeta, RequestKey};
pub use manager::{CacheManager, CacheSummary};
pub use storage::{CacheRole, CacheSet, CacheStorage, NamedCache};
