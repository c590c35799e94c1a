use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// The memoized result of one fetch: shared by every caller of that flight.
pub(crate) type Outcome<V, E> = Result<Arc<V>, Arc<E>>;

/// The internal state of a value being fetched.
pub(crate) enum State<V, E> {
  Computing,
  Complete(Outcome<V, E>),
}

/// The internal, mutex-protected core of a Flight.
///
/// Each pending wait owns one slot in `waiters`, keyed by a flight-local id.
pub(crate) struct Inner<V, E> {
  pub(crate) state: State<V, E>,
  pub(crate) waiters: Vec<(u64, Waker)>,
  next_waiter: u64,
}

/// One fetch execution for one key, awaited by any number of callers.
///
/// It is completed exactly once by the fetch task. [`Flight::wait`] yields the
/// outcome; waiting after completion yields it immediately.
pub(crate) struct Flight<V, E> {
  id: u64,
  pub(crate) inner: Mutex<Inner<V, E>>,
}

impl<V, E> Flight<V, E> {
  /// Creates a new `Flight` in the "Computing" state.
  pub(crate) fn new(id: u64) -> Self {
    Self {
      id,
      inner: Mutex::new(Inner {
        state: State::Computing,
        waiters: Vec::new(),
        next_waiter: 0,
      }),
    }
  }

  /// Shard-unique identity of this flight, used to tell it apart from a later
  /// flight for the same key.
  #[inline]
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  /// Completes the flight with an outcome, waking all waiters.
  ///
  /// A second completion is ignored.
  pub(crate) fn complete(&self, outcome: Outcome<V, E>) {
    let waiters = {
      let mut inner = self.inner.lock();
      if let State::Complete(_) = inner.state {
        return;
      }
      inner.state = State::Complete(outcome);
      std::mem::take(&mut inner.waiters)
    };
    for (_, waker) in waiters {
      waker.wake();
    }
  }

  pub(crate) fn is_complete(&self) -> bool {
    matches!(self.inner.lock().state, State::Complete(_))
  }

  /// Returns a future resolving to this flight's outcome.
  ///
  /// Dropping the future before completion unregisters its waker, so callers that
  /// give up do not accumulate on a long fetch.
  pub(crate) fn wait(&self) -> FlightWait<'_, V, E> {
    FlightWait {
      flight: self,
      slot: None,
    }
  }

  #[cfg(test)]
  pub(crate) fn waiter_count(&self) -> usize {
    self.inner.lock().waiters.len()
  }
}

/// One caller's wait on a [`Flight`].
pub(crate) struct FlightWait<'a, V, E> {
  flight: &'a Flight<V, E>,
  slot: Option<u64>,
}

impl<V, E> Future for FlightWait<'_, V, E> {
  type Output = Outcome<V, E>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let flight = self.flight;
    let mut inner = flight.inner.lock();
    if let State::Complete(outcome) = &inner.state {
      let outcome = outcome.clone();
      self.slot = None;
      return Poll::Ready(outcome);
    }

    // The same wait is polled repeatedly while it selects over other signals.
    let registered = self
      .slot
      .and_then(|id| inner.waiters.iter_mut().find(|(slot, _)| *slot == id));
    match registered {
      Some((_, waker)) => {
        if !waker.will_wake(cx.waker()) {
          *waker = cx.waker().clone();
        }
      }
      None => {
        let id = inner.next_waiter;
        inner.next_waiter += 1;
        inner.waiters.push((id, cx.waker().clone()));
        self.slot = Some(id);
      }
    }
    Poll::Pending
  }
}

impl<V, E> Drop for FlightWait<'_, V, E> {
  fn drop(&mut self) {
    if let Some(id) = self.slot.take() {
      self.flight.inner.lock().waiters.retain(|(slot, _)| *slot != id);
    }
  }
}
