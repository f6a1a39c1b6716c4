//! Two-tier TTL cache for data fetched from the remote backend.
//!
//! - Memory tier in front of a durable key-value store
//! - Entries carry their own TTL and are dropped lazily on read
//! - A background sweep evicts expired memory entries that are never read again
//! - `get_or_fetch` is the entry point used by the rest of the application

mod clock;
mod entry;
pub mod keys;
mod service;
mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;
pub use service::{CacheService, CacheStats, DEFAULT_NAMESPACE};
pub use storage::{DurableStore, MemoryStore, SqliteStore};
