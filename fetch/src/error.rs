use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur when building a fetch manager.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
  /// The manager was configured with zero shards, which is not allowed.
  #[error("shard count cannot be zero")]
  ZeroShards,
  /// No `TaskSpawner` was configured and `build` was called outside of a
  /// Tokio runtime.
  #[error("no task spawner configured and no Tokio runtime is running")]
  NoRuntime,
}

/// The error returned by a fetch.
///
/// `E` is the fetcher's own error type. Upstream errors are shared by every caller
/// that waited on the same fetch, so they are handed out behind an `Arc`.
#[derive(Debug, Error)]
pub enum FetchError<E> {
  /// This caller's own cancellation fired before the fetch resolved. The shared
  /// fetch and any other waiters are unaffected.
  #[error("calling fetch canceled")]
  Canceled,
  /// The shard serving this key has been closed.
  #[error("fetcher has been already closed")]
  Closed,
  /// The fetcher itself failed. The failure is not cached.
  #[error("upstream fetch failed: {0}")]
  Upstream(Arc<E>),
}

impl<E> FetchError<E> {
  pub fn is_canceled(&self) -> bool {
    matches!(self, FetchError::Canceled)
  }

  pub fn is_closed(&self) -> bool {
    matches!(self, FetchError::Closed)
  }

  /// Returns the fetcher's error, if this is an upstream failure.
  pub fn upstream(&self) -> Option<&E> {
    match self {
      FetchError::Upstream(err) => Some(err.as_ref()),
      _ => None,
    }
  }
}

// Manual impl so that `E` itself does not need to be `Clone`.
impl<E> Clone for FetchError<E> {
  fn clone(&self) -> Self {
    match self {
      FetchError::Canceled => FetchError::Canceled,
      FetchError::Closed => FetchError::Closed,
      FetchError::Upstream(err) => FetchError::Upstream(err.clone()),
    }
  }
}

/// The error of a [`Serialized`](crate::fetcher::Serialized) fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SerializedError<E> {
  /// The wrapped fetcher was closed before this fetch got its turn.
  #[error("serialized fetcher has been closed")]
  Closed,
  /// The wrapped fetcher's own error.
  #[error("{0}")]
  Inner(E),
}

/// One shard whose close failed, with the fetcher's error.
#[derive(Debug, Error)]
#[error("shard {shard}: {error}")]
pub struct ShardCloseFailure<E> {
  pub shard: usize,
  pub error: E,
}

/// Every shard failure collected by a best-effort close.
#[derive(Debug)]
pub struct CloseError<E> {
  pub failures: Vec<ShardCloseFailure<E>>,
}

impl<E> CloseError<E> {
  pub fn len(&self) -> usize {
    self.failures.len()
  }

  pub fn is_empty(&self) -> bool {
    self.failures.is_empty()
  }
}

impl<E: fmt::Display> fmt::Display for CloseError<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} shard(s) failed to close", self.failures.len())?;
    for failure in &self.failures {
      write!(f, "\n  {}", failure)?;
    }
    Ok(())
  }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CloseError<E> {}
