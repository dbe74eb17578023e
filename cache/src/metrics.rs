use crate::runtime::TaskSpawner;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

/// Lookup counters shared by the nodes of a cache.
/// All fields are atomic to allow for lock-free updates.
#[derive(Debug)]
pub struct Stat {
  name: String,
  pub(crate) total: CachePadded<AtomicU64>,
  pub(crate) hits: CachePadded<AtomicU64>,
  pub(crate) misses: CachePadded<AtomicU64>,
  pub(crate) db_fails: CachePadded<AtomicU64>,
  created_at: Instant,
}

impl Stat {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      total: CachePadded::new(AtomicU64::new(0)),
      hits: CachePadded::new(AtomicU64::new(0)),
      misses: CachePadded::new(AtomicU64::new(0)),
      db_fails: CachePadded::new(AtomicU64::new(0)),
      created_at: Instant::now(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  pub(crate) fn record_hit(&self) {
    self.total.fetch_add(1, Ordering::Relaxed);
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_miss(&self) {
    self.total.fetch_add(1, Ordering::Relaxed);
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_db_fail(&self) {
    self.db_fails.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the counters.
  pub fn snapshot(&self) -> StatSnapshot {
    StatSnapshot {
      total: self.total.load(Ordering::Relaxed),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      db_fails: self.db_fails.load(Ordering::Relaxed),
      uptime_secs: self.created_at.elapsed().as_secs(),
    }
  }

  /// Logs the traffic of every `interval` at `info` level until the last
  /// strong reference to this `Stat` is dropped.
  pub fn spawn_reporter(self: &Arc<Self>, spawner: &dyn TaskSpawner, interval: Duration) {
    let weak: Weak<Self> = Arc::downgrade(self);
    spawner.spawn(Box::pin(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately.
      ticker.tick().await;
      let mut previous = match weak.upgrade() {
        Some(stat) => stat.snapshot(),
        None => return,
      };
      loop {
        ticker.tick().await;
        let Some(stat) = weak.upgrade() else {
          return;
        };
        let current = stat.snapshot();
        current.since(&previous).log(&stat.name, interval);
        previous = current;
      }
    }));
  }
}

/// A point-in-time copy of a [`Stat`].
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct StatSnapshot {
  /// Cache lookups, hits and misses together.
  pub total: u64,
  pub hits: u64,
  pub misses: u64,
  /// Failed source-of-truth queries on the fill path.
  pub db_fails: u64,
  pub uptime_secs: u64,
}

impl StatSnapshot {
  pub fn hit_ratio(&self) -> f64 {
    if self.total == 0 {
      0.0
    } else {
      self.hits as f64 / self.total as f64
    }
  }

  /// The counters accumulated after `earlier` was taken.
  pub fn since(&self, earlier: &StatSnapshot) -> StatSnapshot {
    StatSnapshot {
      total: self.total.saturating_sub(earlier.total),
      hits: self.hits.saturating_sub(earlier.hits),
      misses: self.misses.saturating_sub(earlier.misses),
      db_fails: self.db_fails.saturating_sub(earlier.db_fails),
      uptime_secs: self.uptime_secs,
    }
  }

  fn log(&self, name: &str, window: Duration) {
    if self.total == 0 && self.db_fails == 0 {
      return;
    }
    let per_minute = self.total as f64 * 60.0 / window.as_secs_f64().max(f64::EPSILON);
    tracing::info!(
      cache = name,
      qpm = per_minute.round() as u64,
      hit_ratio = format_args!("{:.1}%", self.hit_ratio() * 100.0),
      hits = self.hits,
      misses = self.misses,
      db_fails = self.db_fails,
      "cache traffic"
    );
    if self.db_fails > 0 {
      tracing::warn!(cache = name, db_fails = self.db_fails, "cache fill queries failed");
    }
  }
}

impl fmt::Debug for StatSnapshot {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StatSnapshot")
      .field("total", &self.total)
      .field("hits", &self.hits)
      .field("misses", &self.misses)
      .field("hit_ratio", &format!("{:.2}%", self.hit_ratio() * 100.0))
      .field("db_fails", &self.db_fails)
      .field("uptime_secs", &self.uptime_secs)
      .finish()
  }
}
