//! Bridge between a live remote feed, the fallback cache and a consumer.
//!
//! Every live snapshot is written through to the cache before it is handed
//! to the consumer. Feed errors hand the consumer the last cached payload
//! (or the resource default) so it is never left with unlabeled stale data.

use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;

use crate::cache::{decode, FallbackCache, Resource, Snapshot};
use crate::error::{StoreError, StoreResult};
use crate::monitor::ConnectionMonitor;
use crate::remote::{QueryDescriptor, RemoteSnapshot, RemoteStore};

/// Closed flag shared by a subscription and its feed task. Callbacks run
/// while it is held, so closing waits for a running callback to finish.
#[derive(Clone, Default)]
struct Gate(Arc<Mutex<bool>>);

impl Gate {
  fn lock(&self) -> MutexGuard<'_, bool> {
    self.0.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn is_closed(&self) -> bool {
    *self.lock()
  }

  /// Returns false if it was already closed.
  fn close(&self) -> bool {
    !std::mem::replace(&mut *self.lock(), true)
  }
}

/// Handle to a live feed. Closing is idempotent; dropping the handle closes
/// it. A callback must not close its own subscription.
pub struct Subscription {
  resource_key: String,
  gate: Gate,
  task: Mutex<Option<JoinHandle<()>>>,
}

impl Subscription {
  pub fn resource_key(&self) -> &str {
    &self.resource_key
  }

  pub fn is_closed(&self) -> bool {
    self.gate.is_closed()
  }

  /// Stop the feed. Waits for a callback already running on another thread;
  /// no callback runs after this returns.
  pub fn close(&self) {
    if !self.gate.close() {
      return;
    }
    let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(task) = task {
      task.abort();
    }
    tracing::debug!(resource = %self.resource_key, "Subscription closed");
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.close();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("resource_key", &self.resource_key)
      .field("closed", &self.is_closed())
      .finish_non_exhaustive()
  }
}

/// Opens live feeds and keeps the cache and connectivity belief in step.
#[derive(Clone)]
pub struct SubscriptionBridge {
  remote: Arc<dyn RemoteStore>,
  cache: FallbackCache,
  monitor: ConnectionMonitor,
}

impl SubscriptionBridge {
  pub fn new(remote: Arc<dyn RemoteStore>, cache: FallbackCache, monitor: ConnectionMonitor) -> Self {
    Self {
      remote,
      cache,
      monitor,
    }
  }

  /// Open a feed for `query`, caching snapshots under `resource_key`.
  pub fn subscribe<T, S, E>(
    &self,
    resource_key: &str,
    query: &QueryDescriptor,
    on_snapshot: S,
    on_error: E,
  ) -> Subscription
  where
    T: Resource,
    S: FnMut(Snapshot<T>) + Send + 'static,
    E: FnMut(StoreError) + Send + 'static,
  {
    tracing::debug!(
      resource = resource_key,
      query = %query.description(),
      fingerprint = %query.fingerprint(),
      "Opening live feed"
    );

    let gate = Gate::default();
    let feed = Feed {
      resource_key: resource_key.to_string(),
      cache: self.cache.clone(),
      monitor: self.monitor.clone(),
      gate: gate.clone(),
      on_snapshot,
      on_error,
    };
    let task = tokio::spawn(feed.drain::<T>(self.remote.subscribe(query)));

    Subscription {
      resource_key: resource_key.to_string(),
      gate,
      task: Mutex::new(Some(task)),
    }
  }
}

struct Feed<S, E> {
  resource_key: String,
  cache: FallbackCache,
  monitor: ConnectionMonitor,
  gate: Gate,
  on_snapshot: S,
  on_error: E,
}

impl<S, E> Feed<S, E> {
  fn is_closed(&self) -> bool {
    self.gate.is_closed()
  }

  async fn drain<T>(mut self, mut stream: BoxStream<'static, StoreResult<RemoteSnapshot>>)
  where
    T: Resource,
    S: FnMut(Snapshot<T>) + Send + 'static,
    E: FnMut(StoreError) + Send + 'static,
  {
    while let Some(item) = stream.next().await {
      if self.is_closed() {
        break;
      }
      match item {
        Ok(remote) => self.on_remote_snapshot::<T>(remote),
        Err(error) => self.on_feed_error::<T>(error),
      }
    }
    tracing::debug!(resource = %self.resource_key, "Live feed ended");
  }

  fn on_remote_snapshot<T>(&mut self, remote: RemoteSnapshot)
  where
    T: Resource,
    S: FnMut(Snapshot<T>),
    E: FnMut(StoreError),
  {
    let payload = match decode::<T>(&remote.documents) {
      Ok(payload) => payload,
      Err(e) => {
        tracing::warn!(
          resource = %self.resource_key,
          error = %e,
          "Discarding malformed snapshot"
        );
        let fallback = self.cache.load_or_default::<T>(&self.resource_key);
        self.deliver(fallback);
        self.report(StoreError::Malformed(e.to_string()));
        return;
      }
    };

    self.cache.save(&self.resource_key, &payload, remote.read_at);
    self.monitor.record_live_snapshot();
    self.deliver(Snapshot::live(payload, remote.read_at));
  }

  fn on_feed_error<T>(&mut self, error: StoreError)
  where
    T: Resource,
    S: FnMut(Snapshot<T>),
    E: FnMut(StoreError),
  {
    tracing::warn!(resource = %self.resource_key, error = %error, "Live feed error");
    if error.is_connectivity_failure() {
      self.monitor.record_subscription_error();
    }

    let fallback = if error.allows_cache_fallback() {
      self.cache.load_or_default::<T>(&self.resource_key)
    } else {
      Snapshot::default_payload(self.cache.default_for::<T>(&self.resource_key))
    };
    self.deliver(fallback);
    self.report(error);
  }

  fn deliver<T>(&mut self, snapshot: Snapshot<T>)
  where
    S: FnMut(Snapshot<T>),
  {
    let closed = self.gate.lock();
    if !*closed {
      (self.on_snapshot)(snapshot);
    }
  }

  fn report(&mut self, error: StoreError)
  where
    E: FnMut(StoreError),
  {
    let closed = self.gate.lock();
    if !*closed {
      (self.on_error)(error);
    }
  }
}
