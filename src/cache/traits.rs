//! Core traits and types for the fallback cache.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::remote::WriteOp;

/// A record inside a collection resource.
pub trait Document: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Unique identifier of the document within its collection, if it has one yet
  fn document_id(&self) -> Option<String>;
}

/// A payload that can be served to consumers and kept in the fallback cache.
///
/// One resource is one cache entry, typically a whole collection snapshot.
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Payload served when neither the cache nor the remote store has anything.
  fn fallback() -> Self;

  /// Apply a pending write locally before the remote store confirms it.
  ///
  /// Returns false when the write cannot be reflected locally; the live feed
  /// will carry the confirmed state instead.
  fn apply_optimistic(&mut self, _op: &WriteOp) -> bool {
    false
  }
}

impl<D: Document> Resource for Vec<D> {
  fn fallback() -> Self {
    Vec::new()
  }

  fn apply_optimistic(&mut self, op: &WriteOp) -> bool {
    match op {
      WriteOp::Create { document, .. } => {
        let Ok(doc) = serde_json::from_value::<D>(document.clone()) else {
          return false;
        };
        // The remote store assigns the id; wait for the feed to carry it
        let Some(id) = doc.document_id() else {
          return false;
        };
        match self.iter_mut().find(|d| d.document_id().as_deref() == Some(id.as_str())) {
          Some(existing) => *existing = doc,
          // Newest first, like a freshly created row at the top of a list
          None => self.insert(0, doc),
        }
        true
      }
      WriteOp::Update { id, fields, .. } => {
        let Some(existing) = self
          .iter_mut()
          .find(|d| d.document_id().as_deref() == Some(id.as_str()))
        else {
          return false;
        };
        let Ok(mut merged) = serde_json::to_value(&*existing) else {
          return false;
        };
        if let (Some(target), Some(fields)) = (merged.as_object_mut(), fields.as_object()) {
          for (k, v) in fields {
            target.insert(k.clone(), v.clone());
          }
        }
        match serde_json::from_value::<D>(merged) {
          Ok(updated) => {
            *existing = updated;
            true
          }
          Err(_) => false,
        }
      }
      WriteOp::Delete { id, .. } => {
        let before = self.len();
        self.retain(|d| d.document_id().as_deref() != Some(id.as_str()));
        self.len() != before
      }
    }
  }
}

/// The last-known-good payload of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub resource_key: String,
  pub payload: T,
  pub saved_at: DateTime<Utc>,
}

/// Indicates where served data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fresh data from the remote store
  Live,
  /// Last-known-good payload from the fallback cache
  Cache,
  /// Nothing was ever cached; the resource's default payload
  Default,
}

impl DataSource {
  pub fn is_stale(&self) -> bool {
    !matches!(self, DataSource::Live)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      DataSource::Live => "live",
      DataSource::Cache => "cache",
      DataSource::Default => "default",
    }
  }
}

/// A payload as delivered to consumers, labeled with its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot<T> {
  pub payload: T,
  pub source: DataSource,
  /// Remote read time for live data, save time for cached data
  pub timestamp: Option<DateTime<Utc>>,
}

impl<T> Snapshot<T> {
  pub fn live(payload: T, read_at: DateTime<Utc>) -> Self {
    Self {
      payload,
      source: DataSource::Live,
      timestamp: Some(read_at),
    }
  }

  pub fn cached(entry: CacheEntry<T>) -> Self {
    Self {
      payload: entry.payload,
      source: DataSource::Cache,
      timestamp: Some(entry.saved_at),
    }
  }

  pub fn default_payload(payload: T) -> Self {
    Self {
      payload,
      source: DataSource::Default,
      timestamp: None,
    }
  }
}

/// Decode a remote JSON payload into a resource.
pub fn decode<T: Resource>(documents: &Value) -> Result<T, serde_json::Error> {
  T::deserialize(documents)
}

#[cfg(test)]
pub(crate) mod fixtures {
  use super::Document;
  use serde::{Deserialize, Serialize};

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  pub struct Product {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: u32,
  }

  impl Product {
    pub fn new(id: &str, name: &str) -> Self {
      Self {
        id: id.to_string(),
        name: name.to_string(),
        price: 0,
      }
    }
  }

  impl Document for Product {
    fn document_id(&self) -> Option<String> {
      Some(self.id.clone())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::fixtures::Product;
  use super::*;
  use serde_json::json;

  #[test]
  fn test_collection_defaults_to_empty() {
    assert!(<Vec<Product> as Resource>::fallback().is_empty());
  }

  #[test]
  fn test_optimistic_create_update_delete() {
    let mut products = vec![Product::new("p1", "Lamp")];

    assert!(products.apply_optimistic(&WriteOp::Create {
      collection: "products".into(),
      document: json!({"id": "p2", "name": "Desk"}),
    }));
    assert_eq!(products[0].id, "p2");

    assert!(products.apply_optimistic(&WriteOp::Update {
      collection: "products".into(),
      id: "p1".into(),
      fields: json!({"price": 25}),
    }));
    assert_eq!(products[1].price, 25);
    assert_eq!(products[1].name, "Lamp");

    assert!(products.apply_optimistic(&WriteOp::Delete {
      collection: "products".into(),
      id: "p2".into(),
    }));
    assert_eq!(products, vec![Product { price: 25, ..Product::new("p1", "Lamp") }]);
  }

  #[test]
  fn test_optimistic_create_without_id_is_deferred() {
    let mut products: Vec<Product> = Vec::new();
    assert!(!products.apply_optimistic(&WriteOp::Create {
      collection: "products".into(),
      document: json!({"name": "No id yet"}),
    }));
    assert!(products.is_empty());
  }

  #[test]
  fn test_decode_rejects_wrong_shape() {
    assert!(decode::<Vec<Product>>(&json!([{"id": "p1"}])).is_err());
    assert!(decode::<Vec<Product>>(&json!({"id": "p1"})).is_err());
    assert_eq!(
      decode::<Vec<Product>>(&json!([{"id": "p1", "name": "Lamp"}])).unwrap(),
      vec![Product::new("p1", "Lamp")]
    );
  }
}
