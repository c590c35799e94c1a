use crate::builder::FetchConfig;
use crate::error::FetchError;
use crate::fetcher::{Fetcher, Upstream};
use crate::flight::Flight;
use crate::metrics::Metrics;
use crate::runtime::TaskSpawner;
use crate::task::expiry::{self, ExpirationRecord, ExpiryQueue};

use core::fmt;
use std::future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type FlightMap<K, V, E> = HashMap<K, Arc<Flight<V, E>>>;

/// The shared state of one shard: its entries, its expiration queue and its
/// closed signal.
///
/// Lock order: the expiration queue's heap lock is always released before the map
/// lock is taken. Neither lock is held across an await.
pub(crate) struct ShardCore<K, V, F: Fetcher<K, V>> {
  index: usize,
  upstream: Arc<Upstream<F>>,
  map: Mutex<FlightMap<K, V, F::Error>>,
  expiry: Arc<ExpiryQueue<K>>,
  closed: CancellationToken,
  closing: AtomicBool,
  next_flight_id: AtomicU64,
  time_to_live: Duration,
  spawner: Arc<dyn TaskSpawner>,
  metrics: Arc<Metrics>,
}

/// One independently locked partition of a manager.
///
/// Dropping a shard fires its closed signal, stopping the expiration loop and any
/// cancel-aware fetch, but does not close the fetcher.
pub(crate) struct Shard<K, V, F: Fetcher<K, V>> {
  core: Arc<ShardCore<K, V, F>>,
}

impl<K, V, F: Fetcher<K, V>> fmt::Debug for Shard<K, V, F> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Shard")
      .field("index", &self.core.index)
      .field("entries", &self.core.map.lock().len())
      .field("pending_expirations", &self.core.expiry.len())
      .field("closed", &self.core.closing.load(Ordering::Relaxed))
      .finish()
  }
}

impl<K, V, F: Fetcher<K, V>> Drop for Shard<K, V, F> {
  fn drop(&mut self) {
    self.core.closed.cancel();
  }
}

impl<K, V, F> Shard<K, V, F>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  F: Fetcher<K, V>,
{
  /// Creates a shard and spawns its expiration loop.
  pub(crate) fn new(
    index: usize,
    upstream: Arc<Upstream<F>>,
    config: &FetchConfig,
    spawner: Arc<dyn TaskSpawner>,
    metrics: Arc<Metrics>,
  ) -> Self {
    let (queue, wake_rx) = ExpiryQueue::new();
    let core = Arc::new(ShardCore {
      index,
      upstream,
      map: Mutex::new(HashMap::new()),
      expiry: Arc::new(queue),
      closed: CancellationToken::new(),
      closing: AtomicBool::new(false),
      next_flight_id: AtomicU64::new(0),
      time_to_live: config.time_to_live,
      spawner,
      metrics,
    });

    let weak: Weak<ShardCore<K, V, F>> = Arc::downgrade(&core);
    let expiry_loop = expiry::run(
      core.expiry.clone(),
      wake_rx,
      core.closed.clone(),
      config.cleanup_interval,
      move |records| {
        if let Some(core) = weak.upgrade() {
          core.evict_expired(records);
        }
      },
    );
    core.spawner.spawn(Box::pin(expiry_loop));

    Self { core }
  }

  /// Returns the memoized result for `key`, starting a fetch if none is in flight.
  ///
  /// The wait ends on whichever comes first: the fetch resolving, the shard
  /// closing, or `cancel` firing. When several are ready at once, closure wins
  /// over the resolved result, and the resolved result wins over `cancel`.
  pub(crate) fn fetch<'a>(
    &'a self,
    key: K,
    cancel: Option<&'a CancellationToken>,
  ) -> impl future::Future<Output = Result<Arc<V>, FetchError<F::Error>>> + Send + 'a {
    async move {
      if self.core.closed.is_cancelled() {
        Metrics::record(&self.core.metrics.closed, 1);
        return Err(FetchError::Closed);
      }

      let flight = self.core.pick_flight(key);
      self.core.wait(&flight, cancel).await
    }
  }

  /// Broadcasts the closed signal and drops every entry.
  ///
  /// Only the first call does anything. The fetcher is left open; see
  /// [`Shard::close_upstream`].
  pub(crate) fn shutdown(&self) {
    if self.core.closing.swap(true, Ordering::AcqRel) {
      return;
    }

    self.core.closed.cancel();
    self.core.map.lock().clear();
    tracing::debug!(shard = self.core.index, "shard closed");
  }

  /// Closes the shared fetcher. Runs at most once across all shards, so every
  /// call after the first returns `Ok(())`.
  pub(crate) fn close_upstream(&self) -> Result<(), F::Error> {
    self.core.upstream.close_once::<K, V>()
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.core.closing.load(Ordering::Acquire)
  }

  #[cfg(test)]
  pub(crate) fn len(&self) -> usize {
    self.core.map.lock().len()
  }
}

impl<K, V, F> ShardCore<K, V, F>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  F: Fetcher<K, V>,
{
  /// Joins the flight for `key`, or registers a new one and spawns its fetch.
  fn pick_flight(self: &Arc<Self>, key: K) -> Arc<Flight<V, F::Error>> {
    let flight = {
      let mut map = self.map.lock();
      if let Some(flight) = map.get(&key) {
        if flight.is_complete() {
          Metrics::record(&self.metrics.hits, 1);
        } else {
          Metrics::record(&self.metrics.joined, 1);
        }
        return flight.clone();
      }

      let id = self.next_flight_id.fetch_add(1, Ordering::Relaxed);
      let flight = Arc::new(Flight::new(id));
      map.insert(key.clone(), flight.clone());
      flight
    };

    Metrics::record(&self.metrics.misses, 1);
    let task = Self::run_fetch(self.clone(), key, flight.clone());
    self.spawner.spawn(Box::pin(task));

    flight
  }

  /// The single fetch execution behind a flight.
  async fn run_fetch(core: Arc<Self>, key: K, flight: Arc<Flight<V, F::Error>>) {
    // Closed between registration and spawn: waiters already resolve to `Closed`.
    if core.closed.is_cancelled() {
      core.remove_flight(&key, flight.id());
      return;
    }
    tracing::debug!(shard = core.index, flight = flight.id(), "fetch started");

    let result = core
      .upstream
      .fetcher()
      .fetch(key.clone(), core.closed.clone())
      .await;

    match result {
      Ok(value) => {
        flight.complete(Ok(Arc::new(value)));
        core.expiry.schedule(key, flight.id(), core.time_to_live);
      }
      Err(err) => {
        // Evict before completing so a caller that sees the error and retries
        // reaches the fetcher again.
        core.remove_flight(&key, flight.id());
        Metrics::record(&core.metrics.upstream_failures, 1);
        tracing::debug!(shard = core.index, flight = flight.id(), "fetch failed, entry evicted");
        flight.complete(Err(Arc::new(err)));
      }
    }
  }

  async fn wait(
    &self,
    flight: &Flight<V, F::Error>,
    cancel: Option<&CancellationToken>,
  ) -> Result<Arc<V>, FetchError<F::Error>> {
    let canceled = async {
      match cancel {
        Some(token) => token.cancelled().await,
        None => future::pending::<()>().await,
      }
    };

    let result = tokio::select! {
      biased;
      _ = self.closed.cancelled() => Err(FetchError::Closed),
      outcome = flight.wait() => outcome.map_err(FetchError::Upstream),
      _ = canceled => Err(FetchError::Canceled),
    };

    match &result {
      Err(FetchError::Closed) => Metrics::record(&self.metrics.closed, 1),
      Err(FetchError::Canceled) => Metrics::record(&self.metrics.canceled, 1),
      _ => {}
    }
    result
  }

  /// Removes `key` only if it still maps to the flight `flight_id`.
  fn remove_flight(&self, key: &K, flight_id: u64) -> bool {
    let mut map = self.map.lock();
    if map.get(key).is_some_and(|flight| flight.id() == flight_id) {
      map.remove(key);
      true
    } else {
      false
    }
  }

  fn evict_expired(&self, records: Vec<ExpirationRecord<K>>) {
    let mut evicted = 0;
    {
      let mut map = self.map.lock();
      for record in records {
        if map
          .get(&record.key)
          .is_some_and(|flight| flight.id() == record.flight_id)
        {
          map.remove(&record.key);
          evicted += 1;
        }
      }
    }
    Metrics::record(&self.metrics.expired, evicted);
  }
}
