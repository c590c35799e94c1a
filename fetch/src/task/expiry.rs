use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// A key scheduled for eviction at `expires_at`.
///
/// `flight_id` names the successful flight this record was created for, so a
/// record can never evict a later flight that reuses the key.
pub(crate) struct ExpirationRecord<K> {
  pub(crate) expires_at: Instant,
  pub(crate) flight_id: u64,
  pub(crate) key: K,
}

// Records order by expiry only; ties broken by flight id. Keys need no `Ord`.
impl<K> PartialEq for ExpirationRecord<K> {
  fn eq(&self, other: &Self) -> bool {
    self.expires_at == other.expires_at && self.flight_id == other.flight_id
  }
}

impl<K> Eq for ExpirationRecord<K> {}

impl<K> PartialOrd for ExpirationRecord<K> {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl<K> Ord for ExpirationRecord<K> {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .expires_at
      .cmp(&other.expires_at)
      .then(self.flight_id.cmp(&other.flight_id))
  }
}

/// A batch of records whose expiry has passed, and when the next one is due.
pub(crate) struct Expired<K> {
  pub(crate) records: Vec<ExpirationRecord<K>>,
  pub(crate) next_due: Option<Instant>,
}

/// A shard's min-heap of pending expirations plus its coalescing wake signal.
///
/// The heap lock is never held while the shard's map lock is taken.
pub(crate) struct ExpiryQueue<K> {
  heap: Mutex<BinaryHeap<Reverse<ExpirationRecord<K>>>>,
  wake_tx: mpsc::Sender<()>,
}

impl<K> ExpiryQueue<K> {
  /// Creates an empty queue and the receiving half of its wake signal.
  pub(crate) fn new() -> (Self, mpsc::Receiver<()>) {
    // Capacity one: a pending wake already covers any later one.
    let (wake_tx, wake_rx) = mpsc::channel(1);
    let queue = Self {
      heap: Mutex::new(BinaryHeap::new()),
      wake_tx,
    };
    (queue, wake_rx)
  }

  /// Schedules `key` for eviction `ttl` from now.
  ///
  /// If the record becomes the earliest pending expiry, the expiry loop is woken
  /// so it can shorten its sleep. A `ttl` too large to represent as a deadline
  /// schedules nothing: the entry never expires. Returns whether a record was
  /// queued.
  pub(crate) fn schedule(&self, key: K, flight_id: u64, ttl: Duration) -> bool {
    let Some(expires_at) = Instant::now().checked_add(ttl) else {
      tracing::trace!(flight = flight_id, "time-to-live out of range, entry never expires");
      return false;
    };
    let is_root = {
      let mut heap = self.heap.lock();
      heap.push(Reverse(ExpirationRecord {
        expires_at,
        flight_id,
        key,
      }));
      heap
        .peek()
        .is_some_and(|Reverse(root)| root.flight_id == flight_id)
    };

    if is_root {
      let _ = self.wake_tx.try_send(());
    }
    true
  }

  /// Pops every record due at or before `now`.
  pub(crate) fn pop_expired(&self, now: Instant) -> Expired<K> {
    let mut heap = self.heap.lock();
    let mut records = Vec::new();

    while let Some(Reverse(root)) = heap.peek() {
      if root.expires_at > now {
        break;
      }
      if let Some(Reverse(record)) = heap.pop() {
        records.push(record);
      }
    }

    Expired {
      records,
      next_due: heap.peek().map(|Reverse(root)| root.expires_at),
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.heap.lock().len()
  }
}

/// Runs a shard's expiration loop until `closed` fires.
///
/// Each round pops the due records, hands them to `evict` after the heap lock is
/// released, then sleeps for at least `min_interval` before waiting for either the
/// next record's due time or a wake from `schedule`.
pub(crate) async fn run<K, F>(
  queue: Arc<ExpiryQueue<K>>,
  mut wake_rx: mpsc::Receiver<()>,
  closed: CancellationToken,
  min_interval: Duration,
  mut evict: F,
) where
  F: FnMut(Vec<ExpirationRecord<K>>),
{
  loop {
    let Expired { records, next_due } = queue.pop_expired(Instant::now());
    if !records.is_empty() {
      tracing::trace!(expired = records.len(), pending = queue.len(), "expiry sweep");
      evict(records);
    }

    // Bound the sweep frequency under load.
    tokio::select! {
      _ = closed.cancelled() => break,
      _ = time::sleep(min_interval) => {}
    }

    let timer = async {
      match next_due {
        Some(at) => time::sleep_until(at).await,
        None => future::pending::<()>().await,
      }
    };

    tokio::select! {
      _ = closed.cancelled() => break,
      woken = wake_rx.recv() => {
        if woken.is_none() {
          break;
        }
      }
      _ = timer => {}
    }
  }

  tracing::debug!("expiry loop stopped");
}
