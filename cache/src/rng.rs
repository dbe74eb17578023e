use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const WEYL_CONSTANT: u64 = 0x9E3779B97F4A7C15;

/// A fast, `async`-safe, and non-cryptographically secure pseudo-random number
/// generator using a Weyl sequence on an atomic integer.
#[derive(Debug)]
pub(crate) struct FastRng {
  state: AtomicU64,
}

impl FastRng {
  /// Creates a new RNG with a given seed.
  pub fn new(seed: u64) -> Self {
    Self {
      state: AtomicU64::new(if seed == 0 { 1 } else { seed }),
    }
  }

  /// Seeds from the address of a fresh allocation and the clock.
  pub fn from_entropy() -> Self {
    let nanos = std::time::SystemTime::now()
      .duration_since(std::time::UNIX_EPOCH)
      .map_or(0, |d| d.as_nanos() as u64);
    let marker = Box::new(0u8);
    let addr = &*marker as *const u8 as usize as u64;
    Self::new(nanos ^ addr.rotate_left(32))
  }

  /// Atomically advances the Weyl sequence and returns a mixed output.
  #[inline(always)]
  fn next_u64(&self) -> u64 {
    let mut z = self.state.fetch_add(WEYL_CONSTANT, Ordering::Relaxed);
    // splitmix64 finalizer; raw Weyl steps are too regular in the high bits.
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
  }

  /// A float uniformly distributed in `[0, 1)`.
  #[inline]
  pub fn next_f64(&self) -> f64 {
    (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
  }
}

/// Spreads durations around a base value so that entries written together do
/// not all expire in the same instant.
#[derive(Debug)]
pub(crate) struct Unstable {
  deviation: f64,
  rng: FastRng,
}

impl Unstable {
  /// `deviation` is clamped to `[0, 1]`.
  pub fn new(deviation: f64) -> Self {
    let deviation = if deviation.is_finite() {
      deviation.clamp(0.0, 1.0)
    } else {
      0.0
    };
    Self {
      deviation,
      rng: FastRng::from_entropy(),
    }
  }

  /// Returns a duration in `[base * (1 - deviation), base * (1 + deviation)]`.
  pub fn around(&self, base: Duration) -> Duration {
    if self.deviation == 0.0 || base.is_zero() {
      return base;
    }
    let factor = 1.0 + self.deviation - 2.0 * self.deviation * self.rng.next_f64();
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
  }
}
