//! Error taxonomy shared by the remote clients, the cache and the executor.

use std::time::Duration;

use thiserror::Error;

/// Errors produced while talking to the remote store or the local cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
  /// The operation did not finish within its time bound
  #[error("timed out after {0:?}")]
  Timeout(Duration),

  /// The remote store could not be reached or answered with a server error
  #[error("remote store unavailable: {0}")]
  Unavailable(String),

  /// The caller is not allowed to read or write the resource
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  /// A snapshot or cached payload did not have the expected shape
  #[error("malformed payload: {0}")]
  Malformed(String),

  /// The remote store understood the request and refused it
  #[error("rejected by remote store: {0}")]
  Rejected(String),

  /// Local persistence failed
  #[error("local storage error: {0}")]
  Storage(String),
}

/// Coarse classification used for retry and fallback decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  Transient,
  Permission,
  Malformed,
  Rejected,
  Storage,
}

impl StoreError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Timeout(_) | Self::Unavailable(_) => ErrorKind::Transient,
      Self::PermissionDenied(_) => ErrorKind::Permission,
      Self::Malformed(_) => ErrorKind::Malformed,
      Self::Rejected(_) => ErrorKind::Rejected,
      Self::Storage(_) => ErrorKind::Storage,
    }
  }

  /// Whether another attempt of the same operation could succeed.
  pub fn is_retryable(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }

  /// Whether the error says something about reachability of the remote store.
  ///
  /// Permission and shape errors prove the store answered, so they never
  /// demote connectivity.
  pub fn is_connectivity_failure(&self) -> bool {
    self.kind() == ErrorKind::Transient
  }

  /// Whether stale cached data may be served in place of a fresh result.
  pub fn allows_cache_fallback(&self) -> bool {
    self.kind() != ErrorKind::Permission
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(e: serde_json::Error) -> Self {
    Self::Malformed(e.to_string())
  }
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    Self::Storage(e.to_string())
  }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_transient_errors_retry() {
    assert!(StoreError::Timeout(Duration::from_secs(1)).is_retryable());
    assert!(StoreError::Unavailable("connection refused".into()).is_retryable());
    assert!(!StoreError::PermissionDenied("nope".into()).is_retryable());
    assert!(!StoreError::Malformed("bad".into()).is_retryable());
    assert!(!StoreError::Rejected("404".into()).is_retryable());
  }

  #[test]
  fn test_permission_errors_never_fall_back() {
    assert!(!StoreError::PermissionDenied("revoked".into()).allows_cache_fallback());
    assert!(StoreError::Unavailable("down".into()).allows_cache_fallback());
    assert!(StoreError::Rejected("gone".into()).allows_cache_fallback());
  }
}
