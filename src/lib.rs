//! Client-side caching and live-query coordination for the book club app.
//!
//! - [`cache`]: two-tier TTL cache with `get_or_fetch`
//! - [`listener`]: one shared remote subscription per logical key
//! - [`remote`]: the backend interface and its HTTP implementation
//! - [`client`]: the application-facing facade over all three

pub mod cache;
pub mod client;
pub mod config;
pub mod listener;
pub mod logging;
pub mod remote;
mod sync;

pub use cache::{CacheService, DurableStore};
pub use client::CachedClient;
pub use listener::{ListenerRegistry, Subscription};
pub use remote::{Document, QueryDescriptor, RemoteStore};
