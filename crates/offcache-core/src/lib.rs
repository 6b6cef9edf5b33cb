//! Offline-first caching and sync engine.
//!
//! A background `Worker` pre-warms a versioned static cache, routes every
//! same-origin GET through a network-first or cache-first policy, persists
//! foreground state in a `DurableStore`, and asks foreground contexts to
//! upload queued data when connectivity returns.

pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod http;
pub mod protocol;
pub mod router;
pub mod store;
pub mod sync;
pub mod utils;
pub mod worker;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{
    CacheError, ConfigError, NetworkError, ProtocolError, RouteError, StoreError, WorkerError,
};
pub use protocol::{ClientId, ClientMessage, Envelope, SyncPayload, WorkerMessage};
pub use worker::{Lifecycle, Worker};
