//! Local fallback cache for offline support.
//!
//! This module provides a resource-agnostic cache that:
//! - Stores one last-known-good payload per logical resource
//! - Orders writes per resource by timestamp, never by completion order
//! - Serves a per-resource default payload when nothing was ever cached
//! - Treats storage as advisory: failures are logged, never propagated

mod layer;
mod storage;
mod traits;

pub use layer::{ClearScope, FallbackCache, SaveOutcome};
pub use storage::{LocalStore, MemoryStore, NoopStore, SqliteStore, StoredRecord};
pub use traits::{decode, CacheEntry, DataSource, Document, Resource, Snapshot};

#[cfg(test)]
pub(crate) use traits::fixtures;
