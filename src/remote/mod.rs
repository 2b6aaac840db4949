//! Remote document store interface and its implementations.
//!
//! The rest of the crate only sees [`RemoteStore`]; transport, auth and wire
//! format live behind it.

mod http;
mod memory;
mod query;

pub use http::HttpRemoteStore;
pub use memory::MemoryRemote;
pub use query::{Filter, OrderBy, QueryDescriptor};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;

/// A payload delivered by the remote store, stamped with the time it was read.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSnapshot {
  /// Documents matching the query, as a JSON array
  pub documents: Value,
  /// When the remote store produced this view
  pub read_at: DateTime<Utc>,
}

/// A single mutation against a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum WriteOp {
  Create { collection: String, document: Value },
  Update { collection: String, id: String, fields: Value },
  Delete { collection: String, id: String },
}

impl WriteOp {
  pub fn collection(&self) -> &str {
    match self {
      Self::Create { collection, .. }
      | Self::Update { collection, .. }
      | Self::Delete { collection, .. } => collection,
    }
  }

  /// Short name used in logs and failure records.
  pub fn describe(&self) -> String {
    match self {
      Self::Create { collection, .. } => format!("create {}", collection),
      Self::Update { collection, id, .. } => format!("update {}/{}", collection, id),
      Self::Delete { collection, id } => format!("delete {}/{}", collection, id),
    }
  }
}

/// Acknowledgment of a committed write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
  pub id: String,
  pub committed_at: DateTime<Utc>,
}

/// Client for the authoritative, network-accessed document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// One-shot read.
  async fn read(&self, query: &QueryDescriptor) -> StoreResult<RemoteSnapshot>;

  /// Live feed of snapshots and errors. The feed keeps going after an error
  /// when the store recovers; dropping the stream cancels it.
  fn subscribe(&self, query: &QueryDescriptor) -> BoxStream<'static, StoreResult<RemoteSnapshot>>;

  async fn write(&self, op: &WriteOp) -> StoreResult<WriteAck>;
}
