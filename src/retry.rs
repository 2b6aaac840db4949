//! Retrying executor for single remote operations.
//!
//! Each attempt is time-bounded; transient failures back off exponentially
//! with jitter. When attempts run out the executor falls back to the last
//! cached payload, so callers see fresh data, stale-but-usable data, or an
//! error only when nothing usable exists.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::FallbackCache;
use crate::error::{StoreError, StoreResult};
use crate::probe::{Clock, SystemClock};

/// Failures kept for inspection by [`RetryExecutor::recent_failures`].
const FAILURE_HISTORY: usize = 64;

/// Immutable retry configuration, shared by reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  max_attempts: u32,
  base_delay: Duration,
  max_delay: Duration,
  jitter_ratio: f64,
  attempt_timeout: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(500), Duration::from_secs(8)).with_jitter(0.2)
  }
}

impl RetryPolicy {
  /// At least one attempt is always made; `max_delay` never drops below `base_delay`.
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      max_delay: max_delay.max(base_delay),
      jitter_ratio: 0.0,
      attempt_timeout: Duration::from_secs(10),
    }
  }

  /// Jitter ratio, clamped to [0, 1].
  pub fn with_jitter(mut self, ratio: f64) -> Self {
    self.jitter_ratio = if ratio.is_nan() {
      0.0
    } else {
      ratio.clamp(0.0, 1.0)
    };
    self
  }

  pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
    self.attempt_timeout = timeout;
    self
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  pub fn base_delay(&self) -> Duration {
    self.base_delay
  }

  pub fn max_delay(&self) -> Duration {
    self.max_delay
  }

  pub fn jitter_ratio(&self) -> f64 {
    self.jitter_ratio
  }

  pub fn attempt_timeout(&self) -> Duration {
    self.attempt_timeout
  }

  /// `min(max_delay, base_delay * 2^(attempt-1))`, before jitter.
  pub fn nominal_delay(&self, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Delay before the attempt following `attempt` (1-based).
  pub fn backoff(&self, attempt: u32) -> Duration {
    self.backoff_with(attempt, &mut rand::thread_rng())
  }

  pub fn backoff_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
    let nominal = self.nominal_delay(attempt);
    if self.jitter_ratio == 0.0 {
      return nominal;
    }
    let factor = 1.0 + rng.gen_range(-self.jitter_ratio..=self.jitter_ratio);
    nominal.mul_f64(factor).min(self.max_delay)
  }
}

/// Terminal outcome of an executed operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationResult<T> {
  /// Fresh data from the remote store
  Success(T),
  /// The remote store failed; this is the last-known-good payload
  CachedFallback {
    data: T,
    saved_at: DateTime<Utc>,
    reason: StoreError,
  },
  /// Nothing usable
  Failure(StoreError),
}

impl<T> OperationResult<T> {
  pub fn is_success(&self) -> bool {
    matches!(self, Self::Success(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      Self::Success(data) | Self::CachedFallback { data, .. } => Some(data),
      Self::Failure(_) => None,
    }
  }

  pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> OperationResult<U> {
    match self {
      Self::Success(data) => OperationResult::Success(f(data)),
      Self::CachedFallback {
        data,
        saved_at,
        reason,
      } => OperationResult::CachedFallback {
        data: f(data),
        saved_at,
        reason,
      },
      Self::Failure(error) => OperationResult::Failure(error),
    }
  }

  /// The error behind a fallback or failure.
  pub fn error(&self) -> Option<&StoreError> {
    match self {
      Self::Success(_) => None,
      Self::CachedFallback { reason, .. } => Some(reason),
      Self::Failure(error) => Some(error),
    }
  }
}

/// One failed attempt, kept for observability.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
  pub operation: String,
  pub attempt: u32,
  pub error: StoreError,
  /// Delay before the next attempt; `None` when this failure was terminal
  pub retry_in: Option<Duration>,
  pub at: DateTime<Utc>,
}

/// Runs remote operations with bounded retries and cache fallback.
#[derive(Clone)]
pub struct RetryExecutor {
  policy: Arc<RetryPolicy>,
  cache: FallbackCache,
  clock: Arc<dyn Clock>,
  failures: Arc<Mutex<VecDeque<FailureRecord>>>,
}

impl RetryExecutor {
  pub fn new(policy: Arc<RetryPolicy>, cache: FallbackCache) -> Self {
    Self {
      policy,
      cache,
      clock: Arc::new(SystemClock),
      failures: Arc::new(Mutex::new(VecDeque::with_capacity(FAILURE_HISTORY))),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Failed attempts, oldest first.
  pub fn recent_failures(&self) -> Vec<FailureRecord> {
    let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
    failures.iter().cloned().collect()
  }

  /// Run a read, writing successes through to the cache under `cache_key`
  /// and falling back to the cached payload when the remote store fails.
  ///
  /// Successes are stamped with the executor's clock when they complete.
  pub async fn safe_get<T, F, Fut>(
    &self,
    mut operation: F,
    operation_name: &str,
    cache_key: Option<&str>,
  ) -> OperationResult<T>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
  {
    let clock = self.clock.clone();
    self
      .safe_get_stamped(
        || {
          let pending = operation();
          let clock = clock.clone();
          async move { pending.await.map(|data| (data, clock.now())) }
        },
        operation_name,
        cache_key,
      )
      .await
      .map(|(data, _)| data)
  }

  /// Like [`safe_get`](Self::safe_get), for operations that report when
  /// their payload was current (a remote read time).
  ///
  /// That time is what the cache write-through is ordered by, so it competes
  /// fairly with snapshots from a live feed. A fallback carries the cache
  /// entry's save time.
  pub async fn safe_get_stamped<T, F, Fut>(
    &self,
    operation: F,
    operation_name: &str,
    cache_key: Option<&str>,
  ) -> OperationResult<(T, DateTime<Utc>)>
  where
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<(T, DateTime<Utc>)>>,
  {
    let error = match self.attempt(operation, operation_name).await {
      Ok((data, at)) => {
        if let Some(key) = cache_key {
          self.cache.save(key, &data, at);
        }
        return OperationResult::Success((data, at));
      }
      Err(error) => error,
    };

    if !error.allows_cache_fallback() {
      tracing::warn!(
        operation = operation_name,
        error = %error,
        "Operation refused, not serving cached data"
      );
      return OperationResult::Failure(error);
    }

    if let Some(key) = cache_key {
      if let Some(entry) = self.cache.load::<T>(key) {
        tracing::info!(
          operation = operation_name,
          resource = key,
          saved_at = %entry.saved_at,
          error = %error,
          "Serving cached data after remote failure"
        );
        return OperationResult::CachedFallback {
          data: (entry.payload, entry.saved_at),
          saved_at: entry.saved_at,
          reason: error,
        };
      }
    }

    tracing::warn!(operation = operation_name, error = %error, "Operation failed");
    OperationResult::Failure(error)
  }

  /// Run an operation with retries and no cache participation (writes).
  pub async fn run<T, F, Fut>(&self, operation: F, operation_name: &str) -> OperationResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
  {
    match self.attempt(operation, operation_name).await {
      Ok(data) => OperationResult::Success(data),
      Err(error) => {
        tracing::warn!(operation = operation_name, error = %error, "Operation failed");
        OperationResult::Failure(error)
      }
    }
  }

  async fn attempt<T, F, Fut>(&self, mut operation: F, operation_name: &str) -> StoreResult<T>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
  {
    let timeout = self.policy.attempt_timeout();
    let mut attempt = 1;

    loop {
      let outcome = match tokio::time::timeout(timeout, operation()).await {
        Ok(outcome) => outcome,
        Err(_) => Err(StoreError::Timeout(timeout)),
      };

      match outcome {
        Ok(data) => {
          if attempt > 1 {
            tracing::debug!(operation = operation_name, attempt, "Operation recovered");
          }
          return Ok(data);
        }
        Err(error) => {
          let retry_in = (error.is_retryable() && attempt < self.policy.max_attempts())
            .then(|| self.policy.backoff(attempt));
          self.record(operation_name, attempt, &error, retry_in);

          match retry_in {
            Some(delay) => {
              tokio::time::sleep(delay).await;
              attempt += 1;
            }
            None => return Err(error),
          }
        }
      }
    }
  }

  fn record(&self, operation: &str, attempt: u32, error: &StoreError, retry_in: Option<Duration>) {
    tracing::debug!(
      operation,
      attempt,
      max_attempts = self.policy.max_attempts(),
      retry_in_ms = retry_in.map(|d| d.as_millis() as u64),
      error = %error,
      "Attempt failed"
    );

    let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
    if failures.len() == FAILURE_HISTORY {
      failures.pop_front();
    }
    failures.push_back(FailureRecord {
      operation: operation.to_string(),
      attempt,
      error: error.clone(),
      retry_in,
      at: self.clock.now(),
    });
  }
}
