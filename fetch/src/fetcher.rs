//! The boundary to the expensive operation being memoized.

use crate::error::SerializedError;

use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// The boxed future returned by [`Fetcher::fetch`].
pub type FetchFuture<V, E> = BoxFuture<'static, Result<V, E>>;

/// An expensive, fallible, possibly cancel-aware "fetch by key" operation.
///
/// The manager calls `fetch` at most once per key at a time. The `closed` token is
/// the owning shard's closed signal, not any caller's cancellation: it fires only
/// when the shard shuts down. A cancel-aware fetcher should resolve promptly with its
/// own error once it fires; a fetcher that ignores it simply runs to completion and
/// its result is discarded by the closed shard's waiters.
pub trait Fetcher<K, V>: Send + Sync + 'static {
  type Error: Send + Sync + 'static;

  fn fetch(&self, key: K, closed: CancellationToken) -> FetchFuture<V, Self::Error>;

  /// Releases the fetcher's resources.
  ///
  /// Called exactly once, after the closed signal has been broadcast. The default
  /// is a no-op for fetchers with nothing to release.
  fn close(&self) -> Result<(), Self::Error> {
    Ok(())
  }
}

/// A [`Fetcher`] built from a closure that ignores cancellation.
///
/// Created by [`from_fn`].
pub struct FnFetcher<F, K> {
  f: F,
  _key_marker: PhantomData<fn(K)>,
}

/// Builds a fetcher from an async closure `Fn(K) -> Future<Output = Result<V, E>>`.
///
/// The closure never observes shard closure; waiters still return `Closed` when the
/// shard shuts down.
pub fn from_fn<F, K>(f: F) -> FnFetcher<F, K> {
  FnFetcher {
    f,
    _key_marker: PhantomData,
  }
}

impl<F, K, V, E, Fut> Fetcher<K, V> for FnFetcher<F, K>
where
  F: Fn(K) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<V, E>> + Send + 'static,
  K: 'static,
  V: 'static,
  E: Send + Sync + 'static,
{
  type Error = E;

  fn fetch(&self, key: K, _closed: CancellationToken) -> FetchFuture<V, E> {
    (self.f)(key).boxed()
  }
}

/// A [`Fetcher`] built from a closure that receives the closed signal.
///
/// Created by [`from_cancelable_fn`].
pub struct CancelableFnFetcher<F, K> {
  f: F,
  _key_marker: PhantomData<fn(K)>,
}

/// Builds a cancel-aware fetcher from `Fn(K, CancellationToken) -> Future`.
pub fn from_cancelable_fn<F, K>(f: F) -> CancelableFnFetcher<F, K> {
  CancelableFnFetcher {
    f,
    _key_marker: PhantomData,
  }
}

impl<F, K, V, E, Fut> Fetcher<K, V> for CancelableFnFetcher<F, K>
where
  F: Fn(K, CancellationToken) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<V, E>> + Send + 'static,
  K: 'static,
  V: 'static,
  E: Send + Sync + 'static,
{
  type Error = E;

  fn fetch(&self, key: K, closed: CancellationToken) -> FetchFuture<V, E> {
    (self.f)(key, closed).boxed()
  }
}

/// A fetcher that must never run two fetches at once.
///
/// Implementors need only be `Send`: the fetch gets `&mut self`, so plain
/// `RefCell`s, connections and other single-user state are fine. Wrap one with
/// [`from_serialized`] to use it as a [`Fetcher`].
pub trait SerialFetcher<K, V>: Send + 'static {
  type Error: Send + Sync + 'static;

  fn fetch(&mut self, key: K, closed: CancellationToken) -> BoxFuture<'_, Result<V, Self::Error>>;

  fn close(&mut self) -> Result<(), Self::Error> {
    Ok(())
  }
}

struct SerialState<F> {
  fetcher: F,
  closed: bool,
}

impl<F> SerialState<F> {
  fn shut<K, V>(&mut self) -> Result<(), F::Error>
  where
    F: SerialFetcher<K, V>,
  {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    self.fetcher.close()
  }
}

/// A [`Fetcher`] that runs its [`SerialFetcher`] one fetch at a time.
///
/// Created by [`from_serialized`]. The lock is held for the whole fetch future,
/// so fetches of different keys queue behind each other. `close` goes through the
/// same lock: if a fetch holds it, the close is left to that fetch and runs as
/// soon as it finishes. Fetches still queued after a close return
/// [`SerializedError::Closed`].
pub struct Serialized<F> {
  state: Arc<AsyncMutex<SerialState<F>>>,
  close_requested: Arc<AtomicBool>,
}

/// Wraps a fetcher that is not safe to run concurrently.
pub fn from_serialized<F>(fetcher: F) -> Serialized<F> {
  Serialized {
    state: Arc::new(AsyncMutex::new(SerialState {
      fetcher,
      closed: false,
    })),
    close_requested: Arc::new(AtomicBool::new(false)),
  }
}

impl<F> Serialized<F> {
  // A close that found the lock busy is carried out by whoever releases it.
  fn close_deferred<K, V>(state: &AsyncMutex<SerialState<F>>, close_requested: &AtomicBool)
  where
    F: SerialFetcher<K, V>,
  {
    if !close_requested.load(Ordering::SeqCst) {
      return;
    }
    if let Ok(mut state) = state.try_lock() {
      if !state.closed {
        tracing::debug!("closing serialized fetcher after its last fetch");
        if state.shut::<K, V>().is_err() {
          tracing::warn!("deferred close of serialized fetcher failed");
        }
      }
    }
  }
}

impl<F, K, V> Fetcher<K, V> for Serialized<F>
where
  F: SerialFetcher<K, V>,
  K: Send + 'static,
  V: Send + 'static,
{
  type Error = SerializedError<F::Error>;

  fn fetch(&self, key: K, closed: CancellationToken) -> FetchFuture<V, Self::Error> {
    let state = self.state.clone();
    let close_requested = self.close_requested.clone();

    async move {
      let mut guard = tokio::select! {
        biased;
        _ = closed.cancelled() => return Err(SerializedError::Closed),
        guard = state.clone().lock_owned() => guard,
      };

      let result = if guard.closed || close_requested.load(Ordering::SeqCst) {
        Err(SerializedError::Closed)
      } else {
        guard
          .fetcher
          .fetch(key, closed)
          .await
          .map_err(SerializedError::Inner)
      };

      drop(guard);
      Self::close_deferred::<K, V>(&state, &close_requested);
      result
    }
    .boxed()
  }

  fn close(&self) -> Result<(), Self::Error> {
    self.close_requested.store(true, Ordering::SeqCst);
    match self.state.try_lock() {
      Ok(mut state) => state.shut::<K, V>().map_err(SerializedError::Inner),
      Err(_) => {
        tracing::debug!("serialized fetcher busy, close deferred to the running fetch");
        Ok(())
      }
    }
  }
}

/// The fetcher shared by every shard of one manager.
///
/// The router asks every shard to close the upstream once all of them are shut
/// down; only the first of those calls reaches the fetcher.
pub(crate) struct Upstream<F> {
  fetcher: F,
  closed: AtomicBool,
}

impl<F> Upstream<F> {
  pub(crate) fn new(fetcher: F) -> Self {
    Self {
      fetcher,
      closed: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn fetcher(&self) -> &F {
    &self.fetcher
  }

  pub(crate) fn close_once<K, V>(&self) -> Result<(), F::Error>
  where
    F: Fetcher<K, V>,
  {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    self.fetcher.close()
  }
}
