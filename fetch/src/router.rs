use crate::builder::FetchConfig;
use crate::error::{CloseError, ShardCloseFailure};
use crate::fetcher::{Fetcher, Upstream};
use crate::key::ShardKey;
use crate::metrics::Metrics;
use crate::runtime::TaskSpawner;
use crate::shard::Shard;

use core::fmt;
use std::hash::Hash;
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// A fixed array of independently locked shards.
///
/// This design allows for high concurrency by ensuring that operations on
/// different keys are unlikely to contend for the same lock.
pub(crate) struct ShardRouter<K, V, F: Fetcher<K, V>> {
  shards: Box<[CachePadded<Shard<K, V, F>>]>,
}

impl<K, V, F: Fetcher<K, V>> fmt::Debug for ShardRouter<K, V, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ShardRouter")
      .field("num_shards", &self.shards.len())
      .finish()
  }
}

impl<K, V, F> ShardRouter<K, V, F>
where
  K: ShardKey + Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  F: Fetcher<K, V>,
{
  /// Builds `config.shards` shards around one shared fetcher.
  ///
  /// The caller has already validated that `config.shards > 0`.
  pub(crate) fn new(
    fetcher: F,
    config: &FetchConfig,
    spawner: Arc<dyn TaskSpawner>,
    metrics: Arc<Metrics>,
  ) -> Self {
    let upstream = Arc::new(Upstream::new(fetcher));
    let shards = (0..config.shards)
      .map(|index| {
        CachePadded::new(Shard::new(
          index,
          upstream.clone(),
          config,
          spawner.clone(),
          metrics.clone(),
        ))
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();

    Self { shards }
  }

  /// Returns the index of the shard that owns `key`.
  #[inline]
  pub(crate) fn route(&self, key: &K) -> usize {
    (key.shard_hash() % self.shards.len() as u64) as usize
  }

  /// Returns the shard that owns `key`.
  #[inline]
  pub(crate) fn shard(&self, key: &K) -> &Shard<K, V, F> {
    &self.shards[self.route(key)]
  }

  pub(crate) fn len(&self) -> usize {
    self.shards.len()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.shards.iter().all(|shard| shard.is_closed())
  }

  /// Closes every shard, continuing past failures, and reports all of them.
  ///
  /// Every shard's closed signal is broadcast before the fetcher is closed, so no
  /// shard can start a fetch against a closed fetcher.
  pub(crate) fn close(&self) -> Result<(), CloseError<F::Error>> {
    for shard in self.shards.iter() {
      shard.shutdown();
    }

    let mut failures = Vec::new();
    for (index, shard) in self.shards.iter().enumerate() {
      if let Err(error) = shard.close_upstream() {
        tracing::warn!(shard = index, "failed to close shard");
        failures.push(ShardCloseFailure {
          shard: index,
          error,
        });
      }
    }

    if failures.is_empty() {
      Ok(())
    } else {
      Err(CloseError { failures })
    }
  }
}
