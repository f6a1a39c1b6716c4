//! Durable key-value storage backing the second cache tier.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Trait for durable storage backends.
///
/// Values are opaque strings (the cache stores JSON). Every operation may fail
/// with an I/O error; failures are returned as-is and never retried here.
pub trait DurableStore: Send + Sync + 'static {
  /// Read the value stored under `key`.
  fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send;

  /// Store `value` under `key`, replacing any previous value.
  fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send;

  /// Delete `key`. Deleting an absent key is not an error.
  fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

  /// List every stored key, including ones that don't belong to the cache.
  fn list_keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send;
}

impl<S: DurableStore> DurableStore for Arc<S> {
  fn get(&self, key: &str) -> impl Future<Output = Result<Option<String>>> + Send {
    (**self).get(key)
  }

  fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<()>> + Send {
    (**self).set(key, value)
  }

  fn remove(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
    (**self).remove(key)
  }

  fn list_keys(&self) -> impl Future<Output = Result<Vec<String>>> + Send {
    (**self).list_keys()
  }
}

/// Storage that lives only as long as the process.
/// Used when persistence is disabled, and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
  values: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableStore for MemoryStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let values = crate::sync::lock(&self.values, "cache::storage", "get");
    Ok(values.get(key).cloned())
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut values = crate::sync::lock(&self.values, "cache::storage", "set");
    values.insert(key.to_string(), value.to_string());
    Ok(())
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let mut values = crate::sync::lock(&self.values, "cache::storage", "remove");
    values.remove(key);
    Ok(())
  }

  async fn list_keys(&self) -> Result<Vec<String>> {
    let values = crate::sync::lock(&self.values, "cache::storage", "list_keys");
    Ok(values.keys().cloned().collect())
  }
}

/// SQLite-based durable storage.
pub struct SqliteStore {
  conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a store that is discarded when dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("bookclub").join("cache.db"))
  }

  /// Run `f` against the connection on the blocking thread pool.
  async fn blocking<R, F>(&self, op: &'static str, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&conn).map_err(|e| eyre!("Failed to {} cache value: {}", op, e))
    })
    .await
    .map_err(|e| eyre!("Cache storage task failed: {}", e))?
  }
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl DurableStore for SqliteStore {
  async fn get(&self, key: &str) -> Result<Option<String>> {
    let key = key.to_string();
    self
      .blocking("read", move |conn| {
        conn
          .query_row(
            "SELECT value FROM kv_store WHERE key = ?",
            params![key],
            |row| row.get(0),
          )
          .optional()
      })
      .await
  }

  async fn set(&self, key: &str, value: &str) -> Result<()> {
    let key = key.to_string();
    let value = value.to_string();
    self
      .blocking("write", move |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
           VALUES (?, ?, datetime('now'))",
          params![key, value],
        )?;
        Ok(())
      })
      .await
  }

  async fn remove(&self, key: &str) -> Result<()> {
    let key = key.to_string();
    self
      .blocking("delete", move |conn| {
        conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(())
      })
      .await
  }

  async fn list_keys(&self) -> Result<Vec<String>> {
    self
      .blocking("list", |conn| {
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let keys = stmt
          .query_map([], |row| row.get(0))?
          .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
      })
      .await
  }
}
