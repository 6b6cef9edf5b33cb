//! Local key/value persistence for application state.
//!
//! This module provides the `DurableStore`: a crash-resistant store keyed by
//! logical name, backed by JSON files on disk, that transparently degrades
//! to an in-process map when the disk is unusable.
//!
//! Logical keys written by the foreground include:
//! - `gameState` - the current game snapshot, merged by `UPDATE_OFFLINE_STATE`
//! - `messages` - chat or notification history
//! - `pendingActions` - the offline mutation queue

pub mod backend;
pub mod durable;
pub mod file;
pub mod memory;
pub mod pending;

pub use backend::{StoreBackend, StoreRecord};
pub use durable::DurableStore;
pub use file::FileBackend;
pub use memory::MemoryBackend;
pub use pending::PendingAction;

pub const GAME_STATE_KEY: &str = "gameState";
pub const MESSAGES_KEY: &str = "messages";
pub const PENDING_ACTIONS_KEY: &str = "pendingActions";
