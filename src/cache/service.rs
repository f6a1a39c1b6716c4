//! Cache service that puts an in-process memory tier in front of durable storage.

use chrono::Duration;
use color_eyre::Result;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::entry::CacheEntry;
use super::storage::DurableStore;
use crate::sync::lock;

/// Prefix put in front of every cache key in durable storage.
pub const DEFAULT_NAMESPACE: &str = "cache_";

const SOURCE: &str = "cache::service";

/// Snapshot of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  /// Lookups answered by the memory tier
  pub memory_hits: u64,
  /// Lookups answered by durable storage (and promoted to memory)
  pub storage_hits: u64,
  /// Lookups that found nothing valid
  pub misses: u64,
  /// Loader invocations made by `get_or_fetch`
  pub loader_calls: u64,
  /// Memory entries evicted by sweeps
  pub swept: u64,
}

#[derive(Debug, Default)]
struct Counters {
  memory_hits: AtomicU64,
  storage_hits: AtomicU64,
  misses: AtomicU64,
  loader_calls: AtomicU64,
  swept: AtomicU64,
}

impl Counters {
  fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
  }
}

/// Two-tier read-through/write-through cache.
///
/// The memory tier answers repeated reads within a process lifetime; durable
/// storage carries entries across restarts. Storage failures are logged and
/// treated as misses, so only loader errors ever reach the caller.
///
/// Cloning is cheap and every clone shares the same tiers.
pub struct CacheService<S: DurableStore> {
  inner: Arc<Inner<S>>,
}

struct Inner<S> {
  storage: S,
  memory: Mutex<HashMap<String, CacheEntry<Value>>>,
  namespace: String,
  clock: Arc<dyn Clock>,
  counters: Counters,
  sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<S: DurableStore> CacheService<S> {
  /// Create a cache over `storage` using the system clock and the default namespace.
  pub fn new(storage: S) -> Self {
    Self::with_options(storage, DEFAULT_NAMESPACE, Arc::new(SystemClock))
  }

  /// Create a cache with an explicit durable namespace and clock.
  pub fn with_options(storage: S, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
    Self {
      inner: Arc::new(Inner {
        storage,
        memory: Mutex::new(HashMap::new()),
        namespace: namespace.into(),
        clock,
        counters: Counters::default(),
        sweeper: Mutex::new(None),
      }),
    }
  }

  /// The durable storage backend.
  pub fn storage(&self) -> &S {
    &self.inner.storage
  }

  pub fn namespace(&self) -> &str {
    &self.inner.namespace
  }

  fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.inner.namespace, key)
  }

  /// Look up `key`, returning its data only while the entry is valid.
  ///
  /// 1. Memory tier - return on a valid entry, drop an expired one
  /// 2. Durable tier - promote a valid entry to memory, delete an expired one
  /// 3. Otherwise a miss
  pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = self.lookup(key).await?;
    match serde_json::from_value(entry.data) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!(key, error = %e, "Cached value does not match the requested type, treating as miss");
        None
      }
    }
  }

  async fn lookup(&self, key: &str) -> Option<CacheEntry<Value>> {
    let now = self.inner.clock.now();
    let counters = &self.inner.counters;

    {
      let mut memory = lock(&self.inner.memory, SOURCE, "get");
      let cached = memory.get(key).cloned();
      match cached {
        Some(entry) if entry.is_valid(now) => {
          Counters::bump(&counters.memory_hits);
          debug!(key, tier = "memory", "Cache hit");
          return Some(entry);
        }
        Some(_) => {
          memory.remove(key);
        }
        None => {}
      }
    }

    let storage_key = self.storage_key(key);
    match self.inner.storage.get(&storage_key).await {
      Ok(Some(raw)) => match serde_json::from_str::<CacheEntry<Value>>(&raw) {
        Ok(entry) if entry.is_valid(now) => {
          // A concurrent `set` may have landed while storage was being read
          lock(&self.inner.memory, SOURCE, "promote")
            .entry(key.to_string())
            .or_insert_with(|| entry.clone());
          Counters::bump(&counters.storage_hits);
          debug!(key, tier = "storage", "Cache hit");
          return Some(entry);
        }
        Ok(_) => {
          debug!(key, "Stored cache entry expired");
          self.remove_stored(&storage_key).await;
        }
        Err(e) => {
          warn!(key, error = %e, "Discarding corrupted cache entry");
          self.remove_stored(&storage_key).await;
        }
      },
      Ok(None) => {}
      Err(e) => {
        warn!(key, tier = "storage", error = %e, "Failed to read cache entry");
      }
    }

    Counters::bump(&counters.misses);
    debug!(key, "Cache miss");
    None
  }

  /// Cache `data` under `key` for `ttl`.
  ///
  /// The memory entry stands even if the durable write fails.
  pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
    let data = match serde_json::to_value(data) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize value for caching");
        return;
      }
    };

    let entry = CacheEntry::new(data, self.inner.clock.now(), ttl);
    let encoded = serde_json::to_string(&entry);

    lock(&self.inner.memory, SOURCE, "set").insert(key.to_string(), entry);

    match encoded {
      Ok(raw) => {
        if let Err(e) = self.inner.storage.set(&self.storage_key(key), &raw).await {
          warn!(key, tier = "storage", error = %e, "Failed to persist cache entry");
        }
      }
      Err(e) => warn!(key, error = %e, "Failed to encode cache entry"),
    }
  }

  /// Remove `key` from both tiers. Absent keys are a no-op.
  pub async fn remove(&self, key: &str) {
    lock(&self.inner.memory, SOURCE, "remove").remove(key);
    self.remove_stored(&self.storage_key(key)).await;
  }

  /// Remove every key in `keys`, e.g. an invalidation set from [`super::keys`].
  pub async fn remove_many<I, K>(&self, keys: I)
  where
    I: IntoIterator<Item = K>,
    K: AsRef<str>,
  {
    for key in keys {
      self.remove(key.as_ref()).await;
    }
  }

  async fn remove_stored(&self, storage_key: &str) {
    if let Err(e) = self.inner.storage.remove(storage_key).await {
      warn!(key = storage_key, tier = "storage", error = %e, "Failed to delete cache entry");
    }
  }

  /// Empty the memory tier and delete every namespaced durable entry.
  ///
  /// Durable keys outside the namespace are left alone.
  pub async fn clear(&self) {
    lock(&self.inner.memory, SOURCE, "clear").clear();

    let keys = match self.inner.storage.list_keys().await {
      Ok(keys) => keys,
      Err(e) => {
        warn!(tier = "storage", error = %e, "Failed to list cache entries for clearing");
        return;
      }
    };

    let owned: Vec<String> = keys
      .into_iter()
      .filter(|key| key.starts_with(&self.inner.namespace))
      .collect();

    futures::future::join_all(owned.iter().map(|key| self.remove_stored(key))).await;
    debug!(removed = owned.len(), "Cleared cache");
  }

  /// Every cache key currently held in either tier, without the namespace.
  ///
  /// Entries may be expired; validity is only checked on read.
  pub async fn keys(&self) -> Vec<String> {
    let mut keys: BTreeSet<String> = lock(&self.inner.memory, SOURCE, "keys")
      .keys()
      .cloned()
      .collect();

    match self.inner.storage.list_keys().await {
      Ok(stored) => keys.extend(
        stored
          .iter()
          .filter_map(|key| key.strip_prefix(self.inner.namespace.as_str()))
          .map(String::from),
      ),
      Err(e) => warn!(tier = "storage", error = %e, "Failed to list cache entries"),
    }

    keys.into_iter().collect()
  }

  /// Return the cached value for `key`, or load, cache and return it.
  ///
  /// The loader is never called on a hit and called exactly once on a miss.
  /// Loader errors propagate unchanged and nothing is cached for them.
  /// Concurrent cold calls for the same key each run their own loader; the
  /// last write wins.
  pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, loader: F, ttl: Duration) -> Result<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    if let Some(cached) = self.get::<T>(key).await {
      return Ok(cached);
    }

    Counters::bump(&self.inner.counters.loader_calls);
    let data = loader().await?;
    self.set(key, &data, ttl).await;
    Ok(data)
  }

  /// Evict every expired memory entry. Returns how many were evicted.
  pub fn sweep_expired(&self) -> usize {
    self.inner.sweep_expired()
  }

  /// Delete expired and unreadable entries from durable storage, then sweep memory.
  ///
  /// Returns how many durable entries were deleted.
  pub async fn purge_expired(&self) -> usize {
    self.sweep_expired();

    let keys = match self.inner.storage.list_keys().await {
      Ok(keys) => keys,
      Err(e) => {
        warn!(tier = "storage", error = %e, "Failed to list cache entries for purging");
        return 0;
      }
    };

    let now = self.inner.clock.now();
    let mut removed = 0;
    for storage_key in keys.iter().filter(|key| key.starts_with(&self.inner.namespace)) {
      let expired = match self.inner.storage.get(storage_key).await {
        Ok(Some(raw)) => serde_json::from_str::<CacheEntry<Value>>(&raw)
          .map(|entry| !entry.is_valid(now))
          .unwrap_or(true),
        Ok(None) => false,
        Err(e) => {
          warn!(key = storage_key.as_str(), tier = "storage", error = %e, "Failed to read cache entry");
          false
        }
      };

      if expired {
        self.remove_stored(storage_key).await;
        removed += 1;
      }
    }

    debug!(removed, "Purged expired cache entries");
    removed
  }

  /// Number of entries in the memory tier, valid or not.
  pub fn memory_len(&self) -> usize {
    lock(&self.inner.memory, SOURCE, "memory_len").len()
  }

  /// Sweep the memory tier every `every`, replacing any running sweeper.
  ///
  /// The task stops on its own once the last clone of the service is dropped.
  pub fn spawn_sweeper(&self, every: std::time::Duration) {
    let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick completes immediately
      ticker.tick().await;

      loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
          break;
        };
        inner.sweep_expired();
      }
    });

    if let Some(previous) = lock(&self.inner.sweeper, SOURCE, "spawn_sweeper").replace(handle) {
      previous.abort();
    }
  }

  /// Stop the background sweeper, if one is running.
  pub fn shutdown(&self) {
    if let Some(handle) = lock(&self.inner.sweeper, SOURCE, "shutdown").take() {
      handle.abort();
    }
  }

  pub fn stats(&self) -> CacheStats {
    let counters = &self.inner.counters;
    CacheStats {
      memory_hits: counters.memory_hits.load(Ordering::Relaxed),
      storage_hits: counters.storage_hits.load(Ordering::Relaxed),
      misses: counters.misses.load(Ordering::Relaxed),
      loader_calls: counters.loader_calls.load(Ordering::Relaxed),
      swept: counters.swept.load(Ordering::Relaxed),
    }
  }
}

impl<S> Inner<S> {
  fn sweep_expired(&self) -> usize {
    let now = self.clock.now();
    let mut memory = lock(&self.memory, SOURCE, "sweep");
    let before = memory.len();
    memory.retain(|_, entry| entry.is_valid(now));
    let evicted = before - memory.len();
    drop(memory);

    if evicted > 0 {
      self.counters.swept.fetch_add(evicted as u64, Ordering::Relaxed);
      debug!(evicted, "Swept expired cache entries");
    }
    evicted
  }
}

impl<S> Drop for Inner<S> {
  fn drop(&mut self) {
    let sweeper = match self.sweeper.get_mut() {
      Ok(sweeper) => sweeper.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    if let Some(handle) = sweeper {
      handle.abort();
    }
  }
}

impl<S: DurableStore> Clone for CacheService<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
