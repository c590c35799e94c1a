#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibre_fetch::{CancellationToken, FetchFuture, Fetcher};
use futures_util::FutureExt;
use parking_lot::Mutex;

// A fetcher backed by a mutable table. Missing keys resolve to an empty string.
#[derive(Clone, Default)]
pub struct MapFetcher {
  pub table: Arc<Mutex<HashMap<u32, Result<String, String>>>>,
  pub calls: Arc<AtomicUsize>,
}

impl MapFetcher {
  pub fn with(entries: &[(u32, Result<&str, &str>)]) -> Self {
    let fetcher = Self::default();
    for (key, entry) in entries {
      fetcher.set(*key, *entry);
    }
    fetcher
  }

  pub fn set(&self, key: u32, entry: Result<&str, &str>) {
    let entry = entry.map(str::to_string).map_err(str::to_string);
    self.table.lock().insert(key, entry);
  }

  pub fn remove(&self, key: u32) {
    self.table.lock().remove(&key);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Fetcher<u32, String> for MapFetcher {
  type Error = String;

  fn fetch(&self, key: u32, _closed: CancellationToken) -> FetchFuture<String, String> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let result = self.table.lock().get(&key).cloned().unwrap_or(Ok(String::new()));
    async move { result }.boxed()
  }
}

// Sleeps for `delay`, then echoes the key. Aborts early if the shard closes.
#[derive(Clone)]
pub struct SlowEcho {
  pub delay: Duration,
  pub calls: Arc<AtomicUsize>,
}

impl SlowEcho {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      calls: Arc::new(AtomicUsize::new(0)),
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl<K> Fetcher<K, K> for SlowEcho
where
  K: Send + 'static,
{
  type Error = String;

  fn fetch(&self, key: K, closed: CancellationToken) -> FetchFuture<K, String> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let delay = self.delay;
    async move {
      tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(key),
        _ = closed.cancelled() => Err("canceled".to_string()),
      }
    }
    .boxed()
  }
}

// Blocks until the shard closes, counting every abort it observes and every
// time it is closed itself.
#[derive(Clone, Default)]
pub struct BlockUntilClosed {
  pub started: Arc<AtomicUsize>,
  pub aborts: Arc<AtomicUsize>,
  pub closes: Arc<AtomicUsize>,
  pub fail_close: bool,
}

impl BlockUntilClosed {
  pub fn failing_close() -> Self {
    Self {
      fail_close: true,
      ..Self::default()
    }
  }

  pub fn started(&self) -> usize {
    self.started.load(Ordering::SeqCst)
  }

  pub fn aborts(&self) -> usize {
    self.aborts.load(Ordering::SeqCst)
  }

  pub fn closes(&self) -> usize {
    self.closes.load(Ordering::SeqCst)
  }
}

impl Fetcher<&'static str, String> for BlockUntilClosed {
  type Error = String;

  fn fetch(&self, _key: &'static str, closed: CancellationToken) -> FetchFuture<String, String> {
    self.started.fetch_add(1, Ordering::SeqCst);
    let aborts = self.aborts.clone();
    async move {
      closed.cancelled().await;
      aborts.fetch_add(1, Ordering::SeqCst);
      Err("canceled".to_string())
    }
    .boxed()
  }

  fn close(&self) -> Result<(), String> {
    self.closes.fetch_add(1, Ordering::SeqCst);
    if self.fail_close {
      Err("backend refused to close".to_string())
    } else {
      Ok(())
    }
  }
}
