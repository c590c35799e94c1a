mod common;

use common::{BlockUntilClosed, SlowEcho};
use fibre_fetch::{CancellationToken, FetchError, FetchFuture, FetchManager, FetchManagerBuilder, Fetcher};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::test(start_paused = true)]
async fn test_cancel_one_caller_then_close() {
  let fetcher = BlockUntilClosed::default();
  let manager: Arc<FetchManager<&'static str, String, _>> =
    Arc::new(FetchManager::new(fetcher.clone()).unwrap());
  let finished = Arc::new(AtomicUsize::new(0));

  let cancel1 = CancellationToken::new();
  let first = tokio::spawn({
    let manager = manager.clone();
    let cancel1 = cancel1.clone();
    let finished = finished.clone();
    async move {
      let result = manager.fetch_with_cancel("key", &cancel1).await;
      finished.fetch_add(1, Ordering::SeqCst);
      result
    }
  });

  let mut others = Vec::new();
  for key in ["key", "KEY"] {
    let manager = manager.clone();
    let finished = finished.clone();
    others.push(tokio::spawn(async move {
      let result = manager.fetch(key).await;
      finished.fetch_add(1, Ordering::SeqCst);
      result
    }));
  }

  sleep(Duration::from_millis(10)).await;
  assert_eq!(fetcher.started(), 2, "One fetch per distinct key");

  cancel1.cancel();
  let result = first.await.unwrap();
  assert!(matches!(result, Err(FetchError::Canceled)));

  // The other callers and the shared fetch are unaffected.
  sleep(Duration::from_millis(10)).await;
  assert_eq!(finished.load(Ordering::SeqCst), 1);
  assert_eq!(fetcher.aborts(), 0);

  manager.close().unwrap();
  for handle in others {
    let result = handle.await.unwrap();
    assert!(matches!(result, Err(FetchError::Closed)));
  }

  sleep(Duration::from_millis(10)).await;
  assert_eq!(finished.load(Ordering::SeqCst), 3);
  assert_eq!(fetcher.aborts(), 2, "\"key\" and \"KEY\" should each abort once");
  assert_eq!(fetcher.closes(), 1, "The fetcher is closed exactly once");

  let metrics = manager.metrics();
  assert_eq!(metrics.canceled, 1);
  assert_eq!(metrics.closed, 2);
}

#[tokio::test]
async fn test_fetch_after_close_is_rejected() {
  let fetcher = BlockUntilClosed::default();
  let manager: FetchManager<&'static str, String, _> = FetchManager::new(fetcher.clone()).unwrap();

  assert!(!manager.is_closed());
  manager.close().unwrap();
  assert!(manager.is_closed());

  let result = manager.fetch("key").await;
  assert!(matches!(result, Err(FetchError::Closed)));
  assert_eq!(fetcher.started(), 0, "A closed manager never calls the fetcher");
}

#[tokio::test]
async fn test_close_is_idempotent() {
  let fetcher = BlockUntilClosed::default();
  let manager: FetchManager<&'static str, String, _> = FetchManager::new(fetcher.clone()).unwrap();

  assert!(manager.close().is_ok());
  assert!(manager.close().is_ok());
  assert_eq!(fetcher.closes(), 1);
}

#[tokio::test]
async fn test_close_reports_fetcher_failure() {
  let fetcher = BlockUntilClosed::failing_close();
  let manager: FetchManager<&'static str, String, _> = FetchManagerBuilder::new()
    .shards(4)
    .build(fetcher.clone())
    .unwrap();

  let err = manager.close().unwrap_err();
  assert_eq!(err.len(), 1);
  assert_eq!(err.failures[0].shard, 0);
  assert_eq!(err.failures[0].error, "backend refused to close");
  assert_eq!(
    err.to_string(),
    "1 shard(s) failed to close\n  shard 0: backend refused to close"
  );

  // Every shard was still closed.
  assert!(manager.is_closed());
  assert_eq!(fetcher.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_canceled_caller_does_not_disturb_the_shared_fetch() {
  let fetcher = SlowEcho::new(Duration::from_millis(100));
  let manager: Arc<FetchManager<u64, u64, _>> = Arc::new(FetchManager::new(fetcher.clone()).unwrap());

  let cancel = CancellationToken::new();
  let canceled = tokio::spawn({
    let manager = manager.clone();
    let cancel = cancel.clone();
    async move { manager.fetch_with_cancel(1, &cancel).await }
  });
  let patient = tokio::spawn({
    let manager = manager.clone();
    async move { manager.fetch(1).await }
  });

  sleep(Duration::from_millis(20)).await;
  cancel.cancel();

  assert!(matches!(canceled.await.unwrap(), Err(FetchError::Canceled)));
  assert_eq!(*patient.await.unwrap().unwrap(), 1);

  // The result of the abandoned fetch was memoized for everyone.
  assert_eq!(*manager.fetch(1).await.unwrap(), 1);
  assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_already_canceled_token_wins_over_a_pending_fetch() {
  let fetcher = BlockUntilClosed::default();
  let manager: FetchManager<&'static str, String, _> = FetchManager::new(fetcher.clone()).unwrap();

  let cancel = CancellationToken::new();
  cancel.cancel();
  let result = manager.fetch_with_cancel("key", &cancel).await;
  assert!(matches!(result, Err(FetchError::Canceled)));

  manager.close().unwrap();
}

// Blocks until closed, remembering every closed signal it was handed. Its own
// close counts how many of those signals had not fired yet.
#[derive(Clone, Default)]
struct SignalWitness {
  signals: Arc<Mutex<Vec<CancellationToken>>>,
  live_at_close: Arc<AtomicUsize>,
}

impl Fetcher<u32, u32> for SignalWitness {
  type Error = String;

  fn fetch(&self, _key: u32, closed: CancellationToken) -> FetchFuture<u32, String> {
    self.signals.lock().push(closed.clone());
    async move {
      closed.cancelled().await;
      Err("aborted".to_string())
    }
    .boxed()
  }

  fn close(&self) -> Result<(), String> {
    let live = self
      .signals
      .lock()
      .iter()
      .filter(|signal| !signal.is_cancelled())
      .count();
    self.live_at_close.store(live, Ordering::SeqCst);
    Ok(())
  }
}

#[tokio::test(start_paused = true)]
async fn test_fetcher_closes_after_every_shard_is_signalled() {
  let fetcher = SignalWitness::default();
  fetcher.live_at_close.store(usize::MAX, Ordering::SeqCst);
  let manager = Arc::new(
    FetchManagerBuilder::new()
      .shards(4)
      .build(fetcher.clone())
      .unwrap(),
  );

  // One pending fetch on every shard.
  let mut handles = Vec::new();
  for key in 0..4u32 {
    assert_eq!(manager.route(&key), key as usize);
    let manager = manager.clone();
    handles.push(tokio::spawn(async move { manager.fetch(key).await }));
  }
  sleep(Duration::from_millis(10)).await;
  assert_eq!(fetcher.signals.lock().len(), 4);

  manager.close().unwrap();
  assert_eq!(
    fetcher.live_at_close.load(Ordering::SeqCst),
    0,
    "No shard may still be open when the fetcher closes"
  );

  for handle in handles {
    assert!(matches!(handle.await.unwrap(), Err(FetchError::Closed)));
  }
}
