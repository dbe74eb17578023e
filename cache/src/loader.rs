use crate::error::{CacheError, Result};
use crate::runtime::TaskSpawner;

use core::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use ahash::{HashMap, RandomState};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

/// The internal state of a value being loaded.
enum State<T> {
  Computing,
  Complete(Result<T>),
}

struct Inner<T> {
  state: State<T>,
  waiters: Vec<Waker>,
}

/// One in-flight load. Every caller for the key awaits the same `Flight`.
struct Flight<T> {
  inner: Mutex<Inner<T>>,
}

impl<T> Flight<T> {
  fn new() -> Self {
    Self {
      inner: Mutex::new(Inner {
        state: State::Computing,
        waiters: Vec::new(),
      }),
    }
  }

  /// Stores the result and wakes every waiter once.
  fn complete(&self, result: Result<T>) {
    let waiters = {
      let mut inner = self.inner.lock();
      if !matches!(inner.state, State::Computing) {
        return;
      }
      inner.state = State::Complete(result);
      mem::take(&mut inner.waiters)
    };
    for waker in waiters {
      waker.wake();
    }
  }
}

/// Resolves once the flight completes.
#[must_use = "futures do nothing unless you .await or poll them"]
struct FlightWait<T> {
  flight: Arc<Flight<T>>,
}

impl<T: Clone> Future for FlightWait<T> {
  type Output = Result<T>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.flight.inner.lock();
    match &inner.state {
      State::Complete(result) => Poll::Ready(result.clone()),
      State::Computing => {
        if !inner.waiters.iter().any(|w| w.will_wake(cx.waker())) {
          inner.waiters.push(cx.waker().clone());
        }
        Poll::Pending
      }
    }
  }
}

type Slot<T> = CachePadded<Mutex<HashMap<String, Arc<Flight<T>>>>>;

/// The sharded in-flight map.
struct Slots<T> {
  shards: Box<[Slot<T>]>,
  hasher: RandomState,
}

impl<T> Slots<T> {
  #[inline]
  fn shard(&self, key: &str) -> &Mutex<HashMap<String, Arc<Flight<T>>>> {
    let hash = self.hasher.hash_one(key);
    &self.shards[hash as usize & (self.shards.len() - 1)]
  }

  /// Removes `flight` from its slot, unless a newer flight already took it.
  fn release(&self, key: &str, flight: &Arc<Flight<T>>) {
    let mut map = self.shard(key).lock();
    if map.get(key).is_some_and(|current| Arc::ptr_eq(current, flight)) {
      map.remove(key);
    }
  }
}

/// Completes a flight exactly once, even if the load task panics or is
/// dropped before finishing.
struct Completion<T> {
  slots: Arc<Slots<T>>,
  key: String,
  flight: Arc<Flight<T>>,
  done: bool,
}

impl<T> Completion<T> {
  fn finish(&mut self, result: Result<T>) {
    self.done = true;
    // Clear the slot first so a caller arriving after the wake-up starts a
    // fresh load instead of joining this finished one.
    self.slots.release(&self.key, &self.flight);
    self.flight.complete(result);
  }
}

impl<T> Drop for Completion<T> {
  fn drop(&mut self) {
    if !self.done {
      tracing::warn!(key = %self.key, "coalesced load ended without a result");
      self.finish(Err(CacheError::load("load task ended without a result".into())));
    }
  }
}

/// Deduplicates concurrent loads of the same key.
///
/// The first caller for a key registers a flight and its load function is
/// spawned onto the [`TaskSpawner`]; every caller that arrives while the
/// flight is running waits for that same result instead of starting another
/// load. Waiting callers can give up at any time without disturbing the load
/// for the others.
pub struct CoalescingLoader<T> {
  slots: Arc<Slots<T>>,
  spawner: Arc<dyn TaskSpawner>,
}

impl<T> fmt::Debug for CoalescingLoader<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CoalescingLoader")
      .field("num_shards", &self.slots.shards.len())
      .finish_non_exhaustive()
  }
}

impl<T> CoalescingLoader<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(spawner: Arc<dyn TaskSpawner>) -> Self {
    Self::with_shards(spawner, num_cpus::get() * 4)
  }

  pub fn with_shards(spawner: Arc<dyn TaskSpawner>, shards: usize) -> Self {
    let shards = shards.max(1).next_power_of_two();
    let slots = Slots {
      shards: (0..shards)
        .map(|_| CachePadded::new(Mutex::new(HashMap::default())))
        .collect(),
      hasher: RandomState::new(),
    };
    Self {
      slots: Arc::new(slots),
      spawner,
    }
  }

  /// Runs `load` for `key`, or joins the load already running for it.
  ///
  /// Returns the load's result and whether it was shared, i.e. produced by a
  /// flight some other caller started. Errors reach every caller unchanged
  /// and are never replayed to a later call.
  pub async fn load<F, Fut>(&self, key: &str, load: F) -> (Result<T>, bool)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let (flight, shared) = {
      let mut map = self.slots.shard(key).lock();
      match map.get(key) {
        Some(flight) => (flight.clone(), true),
        None => {
          let flight = Arc::new(Flight::new());
          map.insert(key.to_owned(), flight.clone());
          (flight, false)
        }
      }
    };

    if !shared {
      self.launch(key, flight.clone(), load);
    }

    (FlightWait { flight }.await, shared)
  }

  fn launch<F, Fut>(&self, key: &str, flight: Arc<Flight<T>>, load: F)
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let mut completion = Completion {
      slots: self.slots.clone(),
      key: key.to_owned(),
      flight,
      done: false,
    };
    self.spawner.spawn(Box::pin(async move {
      let result = load().await;
      completion.finish(result);
    }));
  }

  /// Number of loads currently in flight.
  pub fn in_flight(&self) -> usize {
    self.slots.shards.iter().map(|shard| shard.lock().len()).sum()
  }
}
