//! Leaf collaborators: wall clock, reachability hint and the store probe.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::StoreResult;
use crate::remote::{QueryDescriptor, RemoteStore};

/// Source of timestamps for cache writes.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Useful for deterministic cache ordering.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  pub fn advance(&self, by: chrono::Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Host-level "is this machine online" hint, consulted before probing.
pub trait ReachabilitySignal: Send + Sync {
  fn host_online(&self) -> bool;
}

/// Reachability hint backed by a flag that the host flips.
#[derive(Debug)]
pub struct StaticReachability {
  online: AtomicBool,
}

impl StaticReachability {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl ReachabilitySignal for StaticReachability {
  fn host_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }
}

/// A cheap check that the remote store answers.
#[async_trait]
pub trait Probe: Send + Sync {
  async fn probe(&self) -> StoreResult<()>;
}

/// Probes the remote store by reading at most one document of a collection.
pub struct StoreProbe {
  remote: Arc<dyn RemoteStore>,
  query: QueryDescriptor,
}

impl StoreProbe {
  pub fn new(remote: Arc<dyn RemoteStore>, collection: &str) -> Self {
    Self {
      remote,
      query: QueryDescriptor::new(collection).limit(1),
    }
  }
}

#[async_trait]
impl Probe for StoreProbe {
  async fn probe(&self) -> StoreResult<()> {
    self.remote.read(&self.query).await.map(|_| ())
  }
}
