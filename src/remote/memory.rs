//! In-process document store with change notifications and fault injection.

use async_trait::async_trait;
use chrono::Utc;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{QueryDescriptor, RemoteSnapshot, RemoteStore, WriteAck, WriteOp};
use crate::error::{StoreError, StoreResult};

type FeedSender = mpsc::UnboundedSender<StoreResult<RemoteSnapshot>>;

struct Subscriber {
  query: QueryDescriptor,
  tx: FeedSender,
}

#[derive(Default)]
struct State {
  collections: HashMap<String, Vec<Value>>,
  unreachable: bool,
  access_denied: bool,
  subscribers: Vec<Subscriber>,
  queued_write_failures: VecDeque<StoreError>,
  next_id: u64,
  reads: usize,
  writes: usize,
}

impl State {
  fn availability(&self) -> StoreResult<()> {
    if self.unreachable {
      return Err(StoreError::Unavailable("remote store unreachable".into()));
    }
    if self.access_denied {
      return Err(StoreError::PermissionDenied("access revoked".into()));
    }
    Ok(())
  }

  fn snapshot(&self, query: &QueryDescriptor) -> RemoteSnapshot {
    let documents = self
      .collections
      .get(&query.collection)
      .map(|docs| query.apply(docs))
      .unwrap_or_default();
    RemoteSnapshot {
      documents: Value::Array(documents),
      read_at: Utc::now(),
    }
  }

  /// Push the current view to matching feeds. Changes made while the store
  /// is unavailable are not observed by anyone.
  fn notify(&mut self, collection: Option<&str>) {
    if self.availability().is_err() {
      return;
    }
    let deliveries: Vec<(usize, RemoteSnapshot)> = self
      .subscribers
      .iter()
      .enumerate()
      .filter(|(_, sub)| collection.map_or(true, |c| c == sub.query.collection))
      .map(|(idx, sub)| (idx, self.snapshot(&sub.query)))
      .collect();

    let mut closed = Vec::new();
    for (idx, snapshot) in deliveries {
      if self.subscribers[idx].tx.unbounded_send(Ok(snapshot)).is_err() {
        closed.push(idx);
      }
    }
    for idx in closed.into_iter().rev() {
      self.subscribers.remove(idx);
    }
  }

  fn broadcast_error(&mut self, error: StoreError) {
    self
      .subscribers
      .retain(|sub| sub.tx.unbounded_send(Err(error.clone())).is_ok());
  }
}

/// Remote store that lives in memory.
///
/// Every write re-fires the feeds of the touched collection, the way a
/// document database notifies listeners. Reachability and access can be
/// toggled to simulate outages.
#[derive(Default)]
pub struct MemoryRemote {
  state: Mutex<State>,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Replace the contents of a collection and notify its feeds.
  pub fn seed(&self, collection: &str, documents: Vec<Value>) {
    let mut state = self.lock();
    state.collections.insert(collection.to_string(), documents);
    state.notify(Some(collection));
  }

  /// Toggle reachability. Going down errors every feed; coming back
  /// re-delivers the current view.
  pub fn set_reachable(&self, reachable: bool) {
    let mut state = self.lock();
    if state.unreachable == !reachable {
      return;
    }
    state.unreachable = !reachable;
    match state.availability() {
      Err(e) => state.broadcast_error(e),
      Ok(()) => state.notify(None),
    }
  }

  pub fn deny_access(&self, denied: bool) {
    let mut state = self.lock();
    if state.access_denied == denied {
      return;
    }
    state.access_denied = denied;
    match state.availability() {
      Err(e) => state.broadcast_error(e),
      Ok(()) => state.notify(None),
    }
  }

  /// Deliver an error to every open feed without changing availability.
  pub fn inject_feed_error(&self, error: StoreError) {
    self.lock().broadcast_error(error);
  }

  /// Deliver a raw document array to every feed of a collection, bypassing
  /// the stored contents.
  pub fn inject_raw_snapshot(&self, collection: &str, documents: Value) {
    let mut state = self.lock();
    let read_at = Utc::now();
    state.subscribers.retain(|sub| {
      sub.query.collection != collection
        || sub
          .tx
          .unbounded_send(Ok(RemoteSnapshot {
            documents: documents.clone(),
            read_at,
          }))
          .is_ok()
    });
  }

  /// Make the next write fail with `error` (queued, one per call).
  pub fn fail_next_write(&self, error: StoreError) {
    self.lock().queued_write_failures.push_back(error);
  }

  pub fn documents(&self, collection: &str) -> Vec<Value> {
    self
      .lock()
      .collections
      .get(collection)
      .cloned()
      .unwrap_or_default()
  }

  pub fn read_count(&self) -> usize {
    self.lock().reads
  }

  pub fn write_count(&self) -> usize {
    self.lock().writes
  }

  /// Number of feeds whose receiving side is still alive.
  pub fn open_feeds(&self) -> usize {
    let mut state = self.lock();
    state.subscribers.retain(|sub| !sub.tx.is_closed());
    state.subscribers.len()
  }

  fn apply_write(state: &mut State, op: &WriteOp) -> StoreResult<String> {
    match op {
      WriteOp::Create {
        collection,
        document,
      } => {
        let mut document = document
          .as_object()
          .cloned()
          .ok_or_else(|| StoreError::Rejected("document must be a JSON object".into()))?;
        let id = match document.get("id").and_then(Value::as_str) {
          Some(id) => id.to_string(),
          None => {
            state.next_id += 1;
            let id = format!("doc-{}", state.next_id);
            document.insert("id".into(), Value::String(id.clone()));
            id
          }
        };
        let docs = state.collections.entry(collection.clone()).or_default();
        if docs.iter().any(|d| document_id(d) == Some(id.as_str())) {
          return Err(StoreError::Rejected(format!("document {} already exists", id)));
        }
        docs.push(Value::Object(document));
        Ok(id)
      }
      WriteOp::Update {
        collection,
        id,
        fields,
      } => {
        let fields: &Map<String, Value> = fields
          .as_object()
          .ok_or_else(|| StoreError::Rejected("fields must be a JSON object".into()))?;
        let doc = state
          .collections
          .get_mut(collection)
          .and_then(|docs| docs.iter_mut().find(|d| document_id(d) == Some(id.as_str())))
          .ok_or_else(|| StoreError::Rejected(format!("document {} not found", id)))?;
        if let Some(target) = doc.as_object_mut() {
          for (k, v) in fields {
            target.insert(k.clone(), v.clone());
          }
        }
        Ok(id.clone())
      }
      WriteOp::Delete { collection, id } => {
        let docs = state
          .collections
          .get_mut(collection)
          .ok_or_else(|| StoreError::Rejected(format!("document {} not found", id)))?;
        let before = docs.len();
        docs.retain(|d| document_id(d) != Some(id.as_str()));
        if docs.len() == before {
          return Err(StoreError::Rejected(format!("document {} not found", id)));
        }
        Ok(id.clone())
      }
    }
  }
}

fn document_id(document: &Value) -> Option<&str> {
  document.get("id").and_then(Value::as_str)
}

#[async_trait]
impl RemoteStore for MemoryRemote {
  async fn read(&self, query: &QueryDescriptor) -> StoreResult<RemoteSnapshot> {
    let mut state = self.lock();
    state.reads += 1;
    state.availability()?;
    Ok(state.snapshot(query))
  }

  fn subscribe(&self, query: &QueryDescriptor) -> BoxStream<'static, StoreResult<RemoteSnapshot>> {
    let (tx, rx) = mpsc::unbounded();
    let mut state = self.lock();
    let first = state.availability().map(|()| state.snapshot(query));
    // The receiver is alive, so the initial send cannot fail.
    let _ = tx.unbounded_send(first);
    state.subscribers.push(Subscriber {
      query: query.clone(),
      tx,
    });
    rx.boxed()
  }

  async fn write(&self, op: &WriteOp) -> StoreResult<WriteAck> {
    let mut state = self.lock();
    state.writes += 1;
    state.availability()?;
    if let Some(error) = state.queued_write_failures.pop_front() {
      return Err(error);
    }
    let id = Self::apply_write(&mut state, op)?;
    state.notify(Some(op.collection()));
    Ok(WriteAck {
      id,
      committed_at: Utc::now(),
    })
  }
}
