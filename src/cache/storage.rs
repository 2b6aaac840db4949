//! Local persistence backends for the fallback cache.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{StoreError, StoreResult};

/// A stored payload with the timestamp it was saved under.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
  pub bytes: Vec<u8>,
  pub saved_at: DateTime<Utc>,
}

/// Trait for local key-value storage backends.
///
/// `put_if_newer` is the only write path: it must compare and write in one
/// step so that concurrent writers to a key are ordered by timestamp.
pub trait LocalStore: Send + Sync {
  fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>>;

  /// Store `bytes` unless the key already holds a newer record.
  /// Returns whether the write happened.
  fn put_if_newer(&self, key: &str, bytes: &[u8], saved_at: DateTime<Utc>) -> StoreResult<bool>;

  fn remove(&self, key: &str) -> StoreResult<()>;

  fn clear(&self) -> StoreResult<()>;

  fn keys(&self) -> StoreResult<Vec<String>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl LocalStore for NoopStore {
  fn get(&self, _key: &str) -> StoreResult<Option<StoredRecord>> {
    Ok(None) // Always miss
  }

  fn put_if_newer(&self, _key: &str, _bytes: &[u8], _saved_at: DateTime<Utc>) -> StoreResult<bool> {
    Ok(false) // Discard
  }

  fn remove(&self, _key: &str) -> StoreResult<()> {
    Ok(())
  }

  fn clear(&self) -> StoreResult<()> {
    Ok(())
  }

  fn keys(&self) -> StoreResult<Vec<String>> {
    Ok(Vec::new())
  }
}

/// Ephemeral in-process storage.
#[derive(Default)]
pub struct MemoryStore {
  records: Mutex<HashMap<String, StoredRecord>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, StoredRecord>>> {
    self
      .records
      .lock()
      .map_err(|e| StoreError::Storage(format!("lock poisoned: {}", e)))
  }
}

impl LocalStore for MemoryStore {
  fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put_if_newer(&self, key: &str, bytes: &[u8], saved_at: DateTime<Utc>) -> StoreResult<bool> {
    let mut records = self.lock()?;
    if let Some(existing) = records.get(key) {
      if saved_at < existing.saved_at {
        return Ok(false);
      }
    }
    records.insert(
      key.to_string(),
      StoredRecord {
        bytes: bytes.to_vec(),
        saved_at,
      },
    );
    Ok(true)
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn clear(&self) -> StoreResult<()> {
    self.lock()?.clear();
    Ok(())
  }

  fn keys(&self) -> StoreResult<Vec<String>> {
    let mut keys: Vec<String> = self.lock()?.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the cache database at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

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

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("catalog-sync").join("cache.db"))
  }

  fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StoreError::Storage(format!("lock poisoned: {}", e)))
  }
}

/// Schema for the fallback cache. `saved_at` is microseconds since the epoch.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fallback_cache (
    resource_key TEXT PRIMARY KEY,
    payload BLOB NOT NULL,
    saved_at INTEGER NOT NULL
);
"#;

impl LocalStore for SqliteStore {
  fn get(&self, key: &str) -> StoreResult<Option<StoredRecord>> {
    let conn = self.lock()?;
    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT payload, saved_at FROM fallback_cache WHERE resource_key = ?",
        params![key],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((bytes, micros)) => {
        let saved_at = DateTime::from_timestamp_micros(micros)
          .ok_or_else(|| StoreError::Storage(format!("invalid saved_at {} for {}", micros, key)))?;
        Ok(Some(StoredRecord { bytes, saved_at }))
      }
      None => Ok(None),
    }
  }

  fn put_if_newer(&self, key: &str, bytes: &[u8], saved_at: DateTime<Utc>) -> StoreResult<bool> {
    let conn = self.lock()?;
    let changed = conn.execute(
      "INSERT INTO fallback_cache (resource_key, payload, saved_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(resource_key) DO UPDATE SET payload = excluded.payload, saved_at = excluded.saved_at
       WHERE excluded.saved_at >= fallback_cache.saved_at",
      params![key, bytes, saved_at.timestamp_micros()],
    )?;
    Ok(changed > 0)
  }

  fn remove(&self, key: &str) -> StoreResult<()> {
    self
      .lock()?
      .execute("DELETE FROM fallback_cache WHERE resource_key = ?", params![key])?;
    Ok(())
  }

  fn clear(&self) -> StoreResult<()> {
    self.lock()?.execute("DELETE FROM fallback_cache", [])?;
    Ok(())
  }

  fn keys(&self) -> StoreResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare("SELECT resource_key FROM fallback_cache ORDER BY resource_key")?;
    let keys = stmt
      .query_map([], |row| row.get(0))?
      .collect::<Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn exercise_ordering(store: &dyn LocalStore) {
    let t1 = Utc::now();
    let t2 = t1 + Duration::seconds(1);

    assert!(store.put_if_newer("products", b"new", t2).unwrap());
    assert!(!store.put_if_newer("products", b"old", t1).unwrap());

    let record = store.get("products").unwrap().unwrap();
    assert_eq!(record.bytes, b"new");
    assert_eq!(record.saved_at.timestamp_micros(), t2.timestamp_micros());

    // Same timestamp: last writer wins
    assert!(store.put_if_newer("products", b"same", t2).unwrap());
    assert_eq!(store.get("products").unwrap().unwrap().bytes, b"same");
  }

  #[test]
  fn test_memory_store_rejects_older_writes() {
    exercise_ordering(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_store_rejects_older_writes() {
    exercise_ordering(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    let saved_at = Utc::now();

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store.put_if_newer("licenses", b"[1,2]", saved_at).unwrap();
      store.put_if_newer("comments", b"[]", saved_at).unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(store.get("licenses").unwrap().unwrap().bytes, b"[1,2]");
    assert_eq!(store.keys().unwrap(), vec!["comments", "licenses"]);

    store.remove("licenses").unwrap();
    assert!(store.get("licenses").unwrap().is_none());

    store.clear().unwrap();
    assert!(store.keys().unwrap().is_empty());
  }

  #[test]
  fn test_noop_store_never_hits() {
    let store = NoopStore;
    assert!(!store.put_if_newer("products", b"[]", Utc::now()).unwrap());
    assert!(store.get("products").unwrap().is_none());
  }
}
