//! Fallback cache that keeps the last-known-good payload of each resource.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::storage::LocalStore;
use super::traits::{CacheEntry, Resource, Snapshot};
use crate::error::StoreResult;

/// Outcome of a cache write. Failures are already logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
  Stored,
  /// A newer entry was already stored; nothing was written
  Superseded,
  Failed,
}

/// What to wipe on [`FallbackCache::clear`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
  All,
  Key(String),
}

/// Advisory cache of last-known-good payloads.
///
/// Cheap to clone; clones share the same storage and defaults. The cache
/// never fails its callers: storage errors are logged and turned into
/// misses or [`SaveOutcome::Failed`].
#[derive(Clone)]
pub struct FallbackCache {
  storage: Arc<dyn LocalStore>,
  defaults: Arc<RwLock<HashMap<String, Value>>>,
}

impl FallbackCache {
  pub fn new(storage: impl LocalStore + 'static) -> Self {
    Self::with_storage(Arc::new(storage))
  }

  pub fn with_storage(storage: Arc<dyn LocalStore>) -> Self {
    Self {
      storage,
      defaults: Arc::new(RwLock::new(HashMap::new())),
    }
  }

  /// Override the default payload of one resource.
  pub fn register_default(&self, resource_key: &str, payload: Value) {
    let mut defaults = self.defaults.write().unwrap_or_else(|e| e.into_inner());
    defaults.insert(resource_key.to_string(), payload);
  }

  /// Persist `payload` unless a newer entry is already stored.
  pub fn save<T: Serialize>(
    &self,
    resource_key: &str,
    payload: &T,
    saved_at: DateTime<Utc>,
  ) -> SaveOutcome {
    let bytes = match serde_json::to_vec(payload) {
      Ok(bytes) => bytes,
      Err(e) => {
        tracing::warn!(resource = resource_key, error = %e, "Failed to serialize cache payload");
        return SaveOutcome::Failed;
      }
    };

    match self.storage.put_if_newer(resource_key, &bytes, saved_at) {
      Ok(true) => {
        tracing::debug!(resource = resource_key, %saved_at, "Cache entry stored");
        SaveOutcome::Stored
      }
      Ok(false) => {
        tracing::debug!(
          resource = resource_key,
          %saved_at,
          "Cache already holds a newer entry, write skipped"
        );
        SaveOutcome::Superseded
      }
      Err(e) => {
        tracing::warn!(resource = resource_key, error = %e, "Failed to write cache entry");
        SaveOutcome::Failed
      }
    }
  }

  /// Most recent entry for the resource, if any usable one is stored.
  pub fn load<T: DeserializeOwned>(&self, resource_key: &str) -> Option<CacheEntry<T>> {
    let record = match self.storage.get(resource_key) {
      Ok(Some(record)) => record,
      Ok(None) => return None,
      Err(e) => {
        tracing::warn!(resource = resource_key, error = %e, "Failed to read cache entry");
        return None;
      }
    };

    match serde_json::from_slice(&record.bytes) {
      Ok(payload) => Some(CacheEntry {
        resource_key: resource_key.to_string(),
        payload,
        saved_at: record.saved_at,
      }),
      Err(e) => {
        tracing::warn!(
          resource = resource_key,
          error = %e,
          "Discarding malformed cache entry"
        );
        None
      }
    }
  }

  /// Default payload of a resource: the registered override if it fits the
  /// type, else the type's own fallback.
  pub fn default_for<T: Resource>(&self, resource_key: &str) -> T {
    let registered = {
      let defaults = self.defaults.read().unwrap_or_else(|e| e.into_inner());
      defaults.get(resource_key).cloned()
    };

    if let Some(value) = registered {
      match serde_json::from_value(value) {
        Ok(payload) => return payload,
        Err(e) => {
          tracing::warn!(
            resource = resource_key,
            error = %e,
            "Registered default does not match the resource type"
          );
        }
      }
    }
    T::fallback()
  }

  /// Cached entry if present, else the default payload.
  pub fn load_or_default<T: Resource>(&self, resource_key: &str) -> Snapshot<T> {
    match self.load(resource_key) {
      Some(entry) => Snapshot::cached(entry),
      None => Snapshot::default_payload(self.default_for(resource_key)),
    }
  }

  pub fn clear(&self, scope: &ClearScope) -> StoreResult<()> {
    let result = match scope {
      ClearScope::All => self.storage.clear(),
      ClearScope::Key(key) => self.storage.remove(key),
    };
    match &result {
      Ok(()) => tracing::info!(scope = ?scope, "Cache cleared"),
      Err(e) => tracing::warn!(scope = ?scope, error = %e, "Failed to clear cache"),
    }
    result
  }

  pub fn keys(&self) -> StoreResult<Vec<String>> {
    self.storage.keys()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::{MemoryStore, StoredRecord};
  use crate::cache::traits::fixtures::Product;
  use crate::cache::DataSource;
  use crate::error::StoreError;
  use chrono::Duration;
  use serde_json::json;

  /// Storage whose every operation fails.
  struct BrokenStore;

  impl LocalStore for BrokenStore {
    fn get(&self, _key: &str) -> StoreResult<Option<StoredRecord>> {
      Err(StoreError::Storage("disk gone".into()))
    }
    fn put_if_newer(&self, _: &str, _: &[u8], _: DateTime<Utc>) -> StoreResult<bool> {
      Err(StoreError::Storage("disk full".into()))
    }
    fn remove(&self, _key: &str) -> StoreResult<()> {
      Err(StoreError::Storage("disk gone".into()))
    }
    fn clear(&self) -> StoreResult<()> {
      Err(StoreError::Storage("disk gone".into()))
    }
    fn keys(&self) -> StoreResult<Vec<String>> {
      Err(StoreError::Storage("disk gone".into()))
    }
  }

  #[test]
  fn test_save_then_load_round_trips() {
    let cache = FallbackCache::new(MemoryStore::new());
    let products = vec![Product::new("p1", "Lamp"), Product::new("p2", "Desk")];
    let saved_at = Utc::now();

    assert_eq!(cache.save("products", &products, saved_at), SaveOutcome::Stored);

    let entry = cache.load::<Vec<Product>>("products").unwrap();
    assert_eq!(entry.payload, products);
    assert_eq!(entry.saved_at, saved_at);
    assert_eq!(entry.resource_key, "products");
  }

  #[test]
  fn test_older_save_never_regresses_entry() {
    let cache = FallbackCache::new(MemoryStore::new());
    let t1 = Utc::now();
    let t2 = t1 + Duration::milliseconds(10);

    cache.save("products", &vec![Product::new("p2", "Newer")], t2);
    assert_eq!(
      cache.save("products", &vec![Product::new("p1", "Older")], t1),
      SaveOutcome::Superseded
    );

    let entry = cache.load::<Vec<Product>>("products").unwrap();
    assert_eq!(entry.payload[0].name, "Newer");
    assert_eq!(entry.saved_at, t2);
  }

  #[test]
  fn test_storage_errors_are_swallowed() {
    let cache = FallbackCache::new(BrokenStore);
    assert_eq!(
      cache.save("products", &Vec::<Product>::new(), Utc::now()),
      SaveOutcome::Failed
    );
    assert!(cache.load::<Vec<Product>>("products").is_none());
    assert_eq!(
      cache.load_or_default::<Vec<Product>>("products").source,
      DataSource::Default
    );
  }

  #[test]
  fn test_malformed_entry_is_discarded() {
    let cache = FallbackCache::new(MemoryStore::new());
    cache.save("products", &json!([{"unexpected": true}]), Utc::now());

    assert!(cache.load::<Vec<Product>>("products").is_none());
    let snapshot = cache.load_or_default::<Vec<Product>>("products");
    assert_eq!(snapshot.source, DataSource::Default);
    assert!(snapshot.payload.is_empty());
  }

  #[test]
  fn test_registered_default_wins_over_type_fallback() {
    let cache = FallbackCache::new(MemoryStore::new());
    cache.register_default("featured", json!([{"id": "p0", "name": "Placeholder"}]));

    let featured: Vec<Product> = cache.default_for("featured");
    assert_eq!(featured, vec![Product::new("p0", "Placeholder")]);

    // Shape mismatch falls back to the empty collection
    cache.register_default("broken", json!({"not": "a list"}));
    assert!(cache.default_for::<Vec<Product>>("broken").is_empty());
  }

  #[test]
  fn test_clear_single_key_and_all() {
    let cache = FallbackCache::new(MemoryStore::new());
    let now = Utc::now();
    cache.save("products", &vec![Product::new("p1", "Lamp")], now);
    cache.save("comments", &Vec::<Product>::new(), now);

    cache.clear(&ClearScope::Key("products".into())).unwrap();
    assert!(cache.load::<Vec<Product>>("products").is_none());
    assert!(cache.load::<Vec<Product>>("comments").is_some());

    cache.clear(&ClearScope::All).unwrap();
    assert!(cache.keys().unwrap().is_empty());
  }

  #[test]
  fn test_clear_reports_storage_errors() {
    let cache = FallbackCache::new(BrokenStore);
    assert!(cache.clear(&ClearScope::All).is_err());
  }
}
