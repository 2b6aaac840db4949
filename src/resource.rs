//! Per-resource orchestration of cache, monitor, live feed and writes.
//!
//! A [`ResourceOrchestrator`] owns the consumer-visible state of one logical
//! resource. The state starts from the cache (or the resource default), is
//! superseded by the live feed, and changes optimistically on writes.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;

use crate::bridge::{Subscription, SubscriptionBridge};
use crate::cache::{decode, DataSource, FallbackCache, Resource, Snapshot};
use crate::error::StoreError;
use crate::monitor::ConnectionMonitor;
use crate::remote::{QueryDescriptor, RemoteStore, WriteAck, WriteOp};
use crate::retry::{OperationResult, RetryExecutor, RetryPolicy};

/// What a consumer sees of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState<T> {
  pub data: T,
  pub source: DataSource,
  /// Remote read time for live data, save time for cached data
  pub updated_at: Option<DateTime<Utc>>,
  /// True until the first feed delivery or while a refetch runs
  pub loading: bool,
  /// Last error from the feed or a write; cleared by the next live data
  pub connection_error: Option<StoreError>,
}

impl<T> ResourceState<T> {
  fn seeded(snapshot: Snapshot<T>) -> Self {
    Self {
      data: snapshot.payload,
      source: snapshot.source,
      updated_at: snapshot.timestamp,
      loading: true,
      connection_error: None,
    }
  }

  fn apply(&mut self, snapshot: Snapshot<T>) {
    if snapshot.source == DataSource::Live {
      self.connection_error = None;
    }
    self.data = snapshot.payload;
    self.source = snapshot.source;
    self.updated_at = snapshot.timestamp;
    self.loading = false;
  }

  pub fn is_stale(&self) -> bool {
    self.source.is_stale()
  }
}

/// Shared services every orchestrator is built from.
#[derive(Clone)]
pub struct SyncContext {
  pub remote: Arc<dyn RemoteStore>,
  pub cache: FallbackCache,
  pub monitor: ConnectionMonitor,
  pub executor: RetryExecutor,
  pub bridge: SubscriptionBridge,
}

impl SyncContext {
  pub fn new(
    remote: Arc<dyn RemoteStore>,
    cache: FallbackCache,
    monitor: ConnectionMonitor,
    policy: Arc<RetryPolicy>,
  ) -> Self {
    let executor = RetryExecutor::new(policy, cache.clone());
    let bridge = SubscriptionBridge::new(remote.clone(), cache.clone(), monitor.clone());
    Self {
      remote,
      cache,
      monitor,
      executor,
      bridge,
    }
  }
}

/// Consumable state plus retry-wrapped mutations for one resource.
///
/// Dropping the orchestrator closes its live feed.
pub struct ResourceOrchestrator<T: Resource> {
  resource_key: String,
  query: QueryDescriptor,
  remote: Arc<dyn RemoteStore>,
  cache: FallbackCache,
  monitor: ConnectionMonitor,
  executor: RetryExecutor,
  state: Arc<watch::Sender<ResourceState<T>>>,
  subscription: Subscription,
}

impl<T: Resource> ResourceOrchestrator<T> {
  /// Seed from the cache, check connectivity once, then open the live feed.
  pub async fn start(ctx: &SyncContext, resource_key: &str, query: QueryDescriptor) -> Self {
    let seed = ctx.cache.load_or_default::<T>(resource_key);
    tracing::info!(
      resource = resource_key,
      source = seed.source.as_str(),
      "Starting resource"
    );
    let (state, _) = watch::channel(ResourceState::seeded(seed));
    let state = Arc::new(state);

    ctx.monitor.check_now().await;

    let on_snapshot = {
      let state = state.clone();
      move |snapshot: Snapshot<T>| state.send_modify(|s| s.apply(snapshot))
    };
    let on_error = {
      let state = state.clone();
      move |error: StoreError| {
        state.send_modify(|s| {
          s.loading = false;
          s.connection_error = Some(error);
        })
      }
    };
    let subscription = ctx
      .bridge
      .subscribe::<T, _, _>(resource_key, &query, on_snapshot, on_error);

    Self {
      resource_key: resource_key.to_string(),
      query,
      remote: ctx.remote.clone(),
      cache: ctx.cache.clone(),
      monitor: ctx.monitor.clone(),
      executor: ctx.executor.clone(),
      state,
      subscription,
    }
  }

  pub fn resource_key(&self) -> &str {
    &self.resource_key
  }

  pub fn state(&self) -> ResourceState<T> {
    self.state.borrow().clone()
  }

  pub fn data(&self) -> T {
    self.state.borrow().data.clone()
  }

  pub fn loading(&self) -> bool {
    self.state.borrow().loading
  }

  pub fn connection_error(&self) -> Option<StoreError> {
    self.state.borrow().connection_error.clone()
  }

  pub fn is_offline(&self) -> bool {
    self.monitor.is_offline()
  }

  /// Receiver notified on every visible-state change.
  pub fn changes(&self) -> watch::Receiver<ResourceState<T>> {
    self.state.subscribe()
  }

  pub async fn create(&self, document: Value) -> OperationResult<WriteAck> {
    self
      .mutate(WriteOp::Create {
        collection: self.query.collection.clone(),
        document,
      })
      .await
  }

  pub async fn update(&self, id: &str, fields: Value) -> OperationResult<WriteAck> {
    self
      .mutate(WriteOp::Update {
        collection: self.query.collection.clone(),
        id: id.to_string(),
        fields,
      })
      .await
  }

  pub async fn delete(&self, id: &str) -> OperationResult<WriteAck> {
    self
      .mutate(WriteOp::Delete {
        collection: self.query.collection.clone(),
        id: id.to_string(),
      })
      .await
  }

  async fn mutate(&self, op: WriteOp) -> OperationResult<WriteAck> {
    let previous = self.state();
    let applied = self.state.send_if_modified(|s| s.data.apply_optimistic(&op));
    // Only the feed or a refetch moves the stamp; a moved stamp means the
    // optimistic data has already been replaced by something newer.
    let stamp = (previous.source, previous.updated_at);
    let operation_name = op.describe();

    let result = self
      .executor
      .run(
        || {
          let remote = self.remote.clone();
          let op = op.clone();
          async move { remote.write(&op).await }
        },
        &operation_name,
      )
      .await;

    match &result {
      OperationResult::Failure(error) => {
        tracing::warn!(
          resource = %self.resource_key,
          operation = %operation_name,
          optimistic = applied,
          error = %error,
          "Write failed"
        );
        let error = error.clone();
        self.state.send_modify(move |s| {
          if applied && (s.source, s.updated_at) == stamp {
            s.data = previous.data;
          }
          s.connection_error = Some(error);
        });
      }
      _ => {
        self.state.send_if_modified(|s| s.connection_error.take().is_some());
      }
    }
    result
  }

  /// One-shot read outside the live feed.
  pub async fn refetch(&self) -> OperationResult<T> {
    self.state.send_modify(|s| s.loading = true);

    let result = self
      .executor
      .safe_get_stamped(
        || {
          let remote = self.remote.clone();
          let query = self.query.clone();
          async move {
            let snapshot = remote.read(&query).await?;
            let data = decode::<T>(&snapshot.documents)?;
            Ok::<_, StoreError>((data, snapshot.read_at))
          }
        },
        &format!("read {}", self.resource_key),
        Some(&self.resource_key),
      )
      .await;

    let next = match &result {
      OperationResult::Success((data, read_at)) => Some(Snapshot::live(data.clone(), *read_at)),
      OperationResult::CachedFallback {
        data: (data, _),
        saved_at,
        ..
      } => Some(Snapshot {
        payload: data.clone(),
        source: DataSource::Cache,
        timestamp: Some(*saved_at),
      }),
      OperationResult::Failure(error) if !error.allows_cache_fallback() => Some(
        Snapshot::default_payload(self.cache.default_for::<T>(&self.resource_key)),
      ),
      OperationResult::Failure(_) => None,
    };
    let error = result.error().cloned();

    self.state.send_modify(|s| {
      match next {
        Some(snapshot) => s.apply(snapshot),
        None => s.loading = false,
      }
      if error.is_some() {
        s.connection_error = error;
      }
    });
    result.map(|(data, _)| data)
  }

  /// Tear down the live feed. No state change happens after this returns.
  pub fn close(&self) {
    self.subscription.close();
  }
}
