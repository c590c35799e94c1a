use crate::builder::{FetchConfig, FetchManagerBuilder};
use crate::error::{BuildError, CloseError, FetchError};
use crate::fetcher::Fetcher;
use crate::key::ShardKey;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::router::ShardRouter;
use crate::runtime::TaskSpawner;

use core::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A sharded, single-flight memoizing front for a [`Fetcher`].
///
/// Concurrent fetches of one key share a single call to the fetcher. A successful
/// result is served to later callers until its time-to-live elapses; a failure is
/// handed to the callers that waited on it and then forgotten.
///
/// Dropping the manager stops every shard's expiration loop but does not call
/// [`Fetcher::close`]; use [`FetchManager::close`] for that.
pub struct FetchManager<K, V, F: Fetcher<K, V>> {
  router: ShardRouter<K, V, F>,
  metrics: Arc<Metrics>,
}

impl<K, V, F: Fetcher<K, V>> fmt::Debug for FetchManager<K, V, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchManager")
      .field("router", &self.router)
      .field("metrics", &self.metrics.snapshot())
      .finish()
  }
}

impl<K, V, F> FetchManager<K, V, F>
where
  K: ShardKey + Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  F: Fetcher<K, V>,
{
  /// Builds a manager with the default configuration on the current Tokio runtime.
  pub fn new(fetcher: F) -> Result<Self, BuildError> {
    FetchManagerBuilder::new().build(fetcher)
  }

  /// Builds a manager from `config` on the current Tokio runtime.
  pub fn with_config(fetcher: F, config: FetchConfig) -> Result<Self, BuildError> {
    FetchManagerBuilder::from_config(config).build(fetcher)
  }

  pub(crate) fn from_parts(fetcher: F, config: &FetchConfig, spawner: Arc<dyn TaskSpawner>) -> Self {
    let metrics = Arc::new(Metrics::new());
    let router = ShardRouter::new(fetcher, config, spawner, metrics.clone());
    tracing::debug!(
      shards = config.shards,
      time_to_live_ms = config.time_to_live.as_millis() as u64,
      "fetch manager built"
    );
    Self { router, metrics }
  }

  /// Returns the value for `key`, fetching it if no live entry exists.
  ///
  /// Returns `Closed` if the key's shard has been closed, or the fetcher's error
  /// wrapped in `Upstream`.
  pub fn fetch(
    &self,
    key: K,
  ) -> impl Future<Output = Result<Arc<V>, FetchError<F::Error>>> + Send + '_ {
    self.router.shard(&key).fetch(key, None)
  }

  /// Like [`fetch`](Self::fetch), but gives up with `Canceled` once `cancel` fires.
  ///
  /// Cancelling abandons only this caller's wait. The shared fetch keeps running and
  /// its result is still memoized for everyone else.
  pub fn fetch_with_cancel<'a>(
    &'a self,
    key: K,
    cancel: &'a CancellationToken,
  ) -> impl Future<Output = Result<Arc<V>, FetchError<F::Error>>> + Send + 'a {
    self.router.shard(&key).fetch(key, Some(cancel))
  }

  /// Like [`fetch`](Self::fetch), but gives up with `Canceled` after `timeout`.
  pub fn fetch_with_timeout(
    &self,
    key: K,
    timeout: Duration,
  ) -> impl Future<Output = Result<Arc<V>, FetchError<F::Error>>> + Send + '_ {
    async move {
      match tokio::time::timeout(timeout, self.fetch(key)).await {
        Ok(result) => result,
        Err(_elapsed) => {
          Metrics::record(&self.metrics.canceled, 1);
          Err(FetchError::Canceled)
        }
      }
    }
  }

  /// Closes every shard, then closes the fetcher once.
  ///
  /// Waiters on every shard return `Closed`, and so does every later fetch. A shard
  /// that fails to close does not stop the others; all failures are returned
  /// together. Calling `close` again is a no-op.
  pub fn close(&self) -> Result<(), CloseError<F::Error>> {
    self.router.close()
  }

  /// Returns the index of the shard that serves `key`.
  pub fn route(&self, key: &K) -> usize {
    self.router.route(key)
  }

  pub fn shard_count(&self) -> usize {
    self.router.len()
  }

  /// Returns `true` once every shard has been closed.
  pub fn is_closed(&self) -> bool {
    self.router.is_closed()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}
