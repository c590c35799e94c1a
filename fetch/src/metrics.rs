use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crossbeam_utils::CachePadded;

/// A thread-safe, internal metrics collector shared by every shard of a manager.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Metrics {
  // --- Lookups ---
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) joined: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,

  // --- Outcomes ---
  pub(crate) upstream_failures: CachePadded<AtomicU64>,
  pub(crate) canceled: CachePadded<AtomicU64>,
  pub(crate) closed: CachePadded<AtomicU64>,

  // --- Eviction ---
  pub(crate) expired: CachePadded<AtomicU64>,

  created_at: Instant,
}

impl Default for Metrics {
  fn default() -> Self {
    Self {
      hits: CachePadded::new(AtomicU64::new(0)),
      joined: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      upstream_failures: CachePadded::new(AtomicU64::new(0)),
      canceled: CachePadded::new(AtomicU64::new(0)),
      closed: CachePadded::new(AtomicU64::new(0)),
      expired: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }
}

impl Metrics {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  #[inline]
  pub(crate) fn record(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metrics.
  pub(crate) fn snapshot(&self) -> MetricsSnapshot {
    let hits = self.hits.load(Ordering::Relaxed);
    let joined = self.joined.load(Ordering::Relaxed);
    let misses = self.misses.load(Ordering::Relaxed);
    let total_lookups = hits + joined + misses;

    MetricsSnapshot {
      hits,
      joined,
      misses,
      hit_ratio: if total_lookups == 0 {
        0.0
      } else {
        hits as f64 / total_lookups as f64
      },
      upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
      canceled: self.canceled.load(Ordering::Relaxed),
      closed: self.closed.load(Ordering::Relaxed),
      expired: self.expired.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }
}

/// A point-in-time, public-facing snapshot of a manager's metrics.
#[derive(Clone)]
pub struct MetricsSnapshot {
  /// Lookups served from an already resolved entry.
  pub hits: u64,
  /// Lookups that joined a fetch still in flight.
  pub joined: u64,
  /// Lookups that found no entry and started a fetch.
  pub misses: u64,
  /// The hit ratio (hits / (hits + joined + misses)).
  pub hit_ratio: f64,
  /// Fetches that resolved with an upstream error.
  pub upstream_failures: u64,
  /// Waits abandoned by the caller's own cancellation.
  pub canceled: u64,
  /// Calls that returned `Closed`.
  pub closed: u64,
  /// Entries evicted by the expiration scheduler.
  pub expired: u64,
  /// Seconds since the manager was built.
  pub uptime_secs: u64,
}

impl fmt::Debug for MetricsSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MetricsSnapshot")
      .field("hits", &self.hits)
      .field("joined", &self.joined)
      .field("misses", &self.misses)
      .field("hit_ratio", &format_args!("{:.2}%", self.hit_ratio * 100.0))
      .field("upstream_failures", &self.upstream_failures)
      .field("canceled", &self.canceled)
      .field("closed", &self.closed)
      .field("expired", &self.expired)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
