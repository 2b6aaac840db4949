//! Connectivity belief about the remote store.
//!
//! The monitor is the only owner of [`ConnectivityState`]. Other components
//! read it, or report subscription events through the monitor's own methods.

use serde::Serialize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::probe::{Probe, ReachabilitySignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
  Unknown,
  Online,
  Offline,
}

struct Inner {
  state: watch::Sender<ConnectivityState>,
  probe: Arc<dyn Probe>,
  reachability: Option<Arc<dyn ReachabilitySignal>>,
  probe_timeout: Duration,
  periodic: Mutex<Option<CancellationToken>>,
}

impl Drop for Inner {
  fn drop(&mut self) {
    let periodic = self.periodic.get_mut().unwrap_or_else(|e| e.into_inner());
    if let Some(token) = periodic.take() {
      token.cancel();
    }
  }
}

/// Tri-state connectivity monitor. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionMonitor {
  inner: Arc<Inner>,
}

impl ConnectionMonitor {
  pub fn new(probe: Arc<dyn Probe>, probe_timeout: Duration) -> Self {
    Self::build(probe, probe_timeout, None)
  }

  /// Monitor that consults a host reachability hint before probing.
  pub fn with_reachability(
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
    reachability: Arc<dyn ReachabilitySignal>,
  ) -> Self {
    Self::build(probe, probe_timeout, Some(reachability))
  }

  fn build(
    probe: Arc<dyn Probe>,
    probe_timeout: Duration,
    reachability: Option<Arc<dyn ReachabilitySignal>>,
  ) -> Self {
    let (state, _) = watch::channel(ConnectivityState::Unknown);
    Self {
      inner: Arc::new(Inner {
        state,
        probe,
        reachability,
        probe_timeout,
        periodic: Mutex::new(None),
      }),
    }
  }

  /// Last known state, without probing.
  pub fn current(&self) -> ConnectivityState {
    *self.inner.state.borrow()
  }

  pub fn is_offline(&self) -> bool {
    self.current() == ConnectivityState::Offline
  }

  /// Receiver notified on every state change.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.inner.state.subscribe()
  }

  /// Probe the remote store once and update the state.
  ///
  /// Never fails: errors and timeouts resolve to `Offline`.
  pub async fn check_now(&self) -> ConnectivityState {
    let next = if self
      .inner
      .reachability
      .as_ref()
      .is_some_and(|r| !r.host_online())
    {
      tracing::debug!("Host reports no network, skipping probe");
      ConnectivityState::Offline
    } else {
      match tokio::time::timeout(self.inner.probe_timeout, self.inner.probe.probe()).await {
        Ok(Ok(())) => ConnectivityState::Online,
        Ok(Err(e)) => {
          tracing::debug!(error = %e, "Connectivity probe failed");
          ConnectivityState::Offline
        }
        Err(_) => {
          tracing::debug!(
            timeout_ms = self.inner.probe_timeout.as_millis() as u64,
            "Connectivity probe timed out"
          );
          ConnectivityState::Offline
        }
      }
    };

    self.transition(next, "probe");
    next
  }

  /// Failure path for live feeds.
  pub fn record_subscription_error(&self) {
    self.transition(ConnectivityState::Offline, "subscription error");
  }

  /// A live snapshot arrived, so the store is reachable.
  pub fn record_live_snapshot(&self) {
    self.transition(ConnectivityState::Online, "live snapshot");
  }

  fn transition(&self, next: ConnectivityState, cause: &str) {
    let previous = self.inner.state.send_replace(next);
    if previous != next {
      tracing::info!(from = ?previous, to = ?next, cause, "Connectivity changed");
    }
  }

  /// Run [`check_now`](Self::check_now) every `interval`.
  ///
  /// No-op while a periodic check is already running.
  pub fn start_periodic_check(&self, interval: Duration) {
    let mut periodic = self.inner.periodic.lock().unwrap_or_else(|e| e.into_inner());
    if periodic.as_ref().is_some_and(|t| !t.is_cancelled()) {
      tracing::debug!("Periodic connectivity check already running");
      return;
    }

    let token = CancellationToken::new();
    let weak = Arc::downgrade(&self.inner);
    tokio::spawn(periodic_check(weak, interval, token.clone()));
    *periodic = Some(token);
    tracing::debug!(interval_ms = interval.as_millis() as u64, "Periodic connectivity check started");
  }

  pub fn stop(&self) {
    let mut periodic = self.inner.periodic.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(token) = periodic.take() {
      token.cancel();
      tracing::debug!("Periodic connectivity check stopped");
    }
  }

  pub fn is_checking_periodically(&self) -> bool {
    let periodic = self.inner.periodic.lock().unwrap_or_else(|e| e.into_inner());
    periodic.as_ref().is_some_and(|t| !t.is_cancelled())
  }
}

/// Holds only a weak reference so a dropped monitor ends the loop.
async fn periodic_check(inner: Weak<Inner>, interval: Duration, token: CancellationToken) {
  let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
  // The first tick completes immediately
  ticker.tick().await;

  loop {
    tokio::select! {
      _ = token.cancelled() => break,
      _ = ticker.tick() => {
        let Some(inner) = inner.upgrade() else { break };
        let monitor = ConnectionMonitor { inner };
        tokio::select! {
          _ = token.cancelled() => break,
          _ = monitor.check_now() => {}
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{StoreError, StoreResult};
  use crate::probe::StaticReachability;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  /// Probe whose outcome the test controls.
  struct ScriptedProbe {
    healthy: AtomicBool,
    hang: AtomicBool,
    calls: AtomicUsize,
  }

  impl ScriptedProbe {
    fn new(healthy: bool) -> Arc<Self> {
      Arc::new(Self {
        healthy: AtomicBool::new(healthy),
        hang: AtomicBool::new(false),
        calls: AtomicUsize::new(0),
      })
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl Probe for ScriptedProbe {
    async fn probe(&self) -> StoreResult<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if self.hang.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(3600)).await;
      }
      if self.healthy.load(Ordering::SeqCst) {
        Ok(())
      } else {
        Err(StoreError::Unavailable("no route to host".into()))
      }
    }
  }

  #[tokio::test]
  async fn test_initial_state_is_unknown() {
    let monitor = ConnectionMonitor::new(ScriptedProbe::new(true), Duration::from_secs(1));
    assert_eq!(monitor.current(), ConnectivityState::Unknown);
    assert!(!monitor.is_offline());
  }

  #[tokio::test]
  async fn test_probe_results_drive_transitions() {
    let probe = ScriptedProbe::new(false);
    let monitor = ConnectionMonitor::new(probe.clone(), Duration::from_secs(1));

    assert_eq!(monitor.check_now().await, ConnectivityState::Offline);
    probe.healthy.store(true, Ordering::SeqCst);
    assert_eq!(monitor.check_now().await, ConnectivityState::Online);
    probe.healthy.store(false, Ordering::SeqCst);
    assert_eq!(monitor.check_now().await, ConnectivityState::Offline);
    assert!(monitor.is_offline());
  }

  #[tokio::test(start_paused = true)]
  async fn test_probe_timeout_counts_as_offline() {
    let probe = ScriptedProbe::new(true);
    let monitor = ConnectionMonitor::new(probe.clone(), Duration::from_millis(500));
    assert_eq!(monitor.check_now().await, ConnectivityState::Online);

    probe.hang.store(true, Ordering::SeqCst);
    assert_eq!(monitor.check_now().await, ConnectivityState::Offline);

    probe.hang.store(false, Ordering::SeqCst);
    assert_eq!(monitor.check_now().await, ConnectivityState::Online);
  }

  #[tokio::test]
  async fn test_reachability_hint_short_circuits_probe() {
    let probe = ScriptedProbe::new(true);
    let hint = Arc::new(StaticReachability::new(false));
    let monitor =
      ConnectionMonitor::with_reachability(probe.clone(), Duration::from_secs(1), hint.clone());

    assert_eq!(monitor.check_now().await, ConnectivityState::Offline);
    assert_eq!(probe.calls(), 0);

    hint.set_online(true);
    assert_eq!(monitor.check_now().await, ConnectivityState::Online);
    assert_eq!(probe.calls(), 1);
  }

  #[tokio::test]
  async fn test_subscription_events_and_watchers() {
    let monitor = ConnectionMonitor::new(ScriptedProbe::new(true), Duration::from_secs(1));
    let mut rx = monitor.watch();

    monitor.check_now().await;
    assert!(rx.has_changed().unwrap());
    assert_eq!(*rx.borrow_and_update(), ConnectivityState::Online);

    monitor.record_subscription_error();
    assert_eq!(*rx.borrow_and_update(), ConnectivityState::Offline);

    monitor.record_live_snapshot();
    assert_eq!(monitor.current(), ConnectivityState::Online);
  }

  #[tokio::test(start_paused = true)]
  async fn test_periodic_check_is_idempotent_and_stoppable() {
    let probe = ScriptedProbe::new(true);
    let monitor = ConnectionMonitor::new(probe.clone(), Duration::from_secs(1));

    monitor.start_periodic_check(Duration::from_secs(30));
    monitor.start_periodic_check(Duration::from_secs(30));
    assert!(monitor.is_checking_periodically());

    tokio::time::sleep(Duration::from_secs(95)).await;
    assert_eq!(probe.calls(), 3);
    assert_eq!(monitor.current(), ConnectivityState::Online);

    monitor.stop();
    monitor.stop();
    assert!(!monitor.is_checking_periodically());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(probe.calls(), 3);

    // Restart after stop works
    monitor.start_periodic_check(Duration::from_secs(30));
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(probe.calls(), 4);
    monitor.stop();
  }

  #[tokio::test(start_paused = true)]
  async fn test_dropping_monitor_ends_periodic_check() {
    let probe = ScriptedProbe::new(true);
    let monitor = ConnectionMonitor::new(probe.clone(), Duration::from_secs(1));
    monitor.start_periodic_check(Duration::from_secs(10));

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(probe.calls(), 1);

    drop(monitor);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(probe.calls(), 1);
  }
}
