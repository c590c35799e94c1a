use crate::error::BuildError;
use crate::fetcher::Fetcher;
use crate::key::ShardKey;
use crate::manager::FetchManager;
use crate::runtime::{TaskSpawner, TokioSpawner};

use core::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// The default lifetime of a successful entry.
pub const DEFAULT_TIME_TO_LIVE: Duration = Duration::from_secs(60);

/// The default minimum spacing between expiration sweeps of one shard.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// The default number of shards.
pub const DEFAULT_SHARDS: usize = 10;

/// Settings shared by every shard of a manager.
///
/// With the `serde` feature this can be embedded in an application's own config;
/// missing fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FetchConfig {
  /// How long a successful result is served, measured from when its fetch
  /// resolved. Access does not extend it.
  pub time_to_live: Duration,
  /// The minimum spacing between two expiration sweeps of one shard.
  pub cleanup_interval: Duration,
  /// The number of independently locked shards. Must be at least one.
  pub shards: usize,
}

impl Default for FetchConfig {
  fn default() -> Self {
    Self {
      time_to_live: DEFAULT_TIME_TO_LIVE,
      cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
      shards: DEFAULT_SHARDS,
    }
  }
}

impl FetchConfig {
  /// Validates the configuration.
  pub fn validate(&self) -> Result<(), BuildError> {
    if self.shards == 0 {
      return Err(BuildError::ZeroShards);
    }
    Ok(())
  }
}

/// A builder for creating `FetchManager` instances.
#[derive(Default)]
pub struct FetchManagerBuilder {
  config: FetchConfig,
  spawner: Option<Arc<dyn TaskSpawner>>,
}

impl fmt::Debug for FetchManagerBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FetchManagerBuilder")
      .field("config", &self.config)
      .field("has_spawner", &self.spawner.is_some())
      .finish()
  }
}

impl FetchManagerBuilder {
  /// Creates a new `FetchManagerBuilder` with default settings.
  pub fn new() -> Self {
    Self::default()
  }

  /// Starts from an existing configuration.
  pub fn from_config(config: FetchConfig) -> Self {
    Self {
      config,
      spawner: None,
    }
  }

  /// Sets how long successful results are served.
  pub fn time_to_live(mut self, duration: Duration) -> Self {
    self.config.time_to_live = duration;
    self
  }

  /// Sets the minimum spacing between expiration sweeps.
  pub fn cleanup_interval(mut self, duration: Duration) -> Self {
    self.config.cleanup_interval = duration;
    self
  }

  /// Sets the number of shards. Zero is rejected by `build`.
  pub fn shards(mut self, shards: usize) -> Self {
    self.config.shards = shards;
    self
  }

  /// Sets the spawner used for fetch tasks and expiration loops.
  ///
  /// Defaults to the Tokio runtime that is current when `build` is called.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  pub fn config(&self) -> &FetchConfig {
    &self.config
  }

  /// Builds a manager around `fetcher`.
  pub fn build<K, V, F>(self, fetcher: F) -> Result<FetchManager<K, V, F>, BuildError>
  where
    K: ShardKey + Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    F: Fetcher<K, V>,
  {
    self.config.validate()?;

    let spawner = match self.spawner {
      Some(spawner) => spawner,
      None => {
        let tokio = TokioSpawner::try_current().ok_or(BuildError::NoRuntime)?;
        Arc::new(tokio) as Arc<dyn TaskSpawner>
      }
    };

    Ok(FetchManager::from_parts(fetcher, &self.config, spawner))
  }
}
