use std::time::Duration;

/// Default lifetime of entries written by `set` and `take`.
pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// Default lifetime of the placeholder written when the source has no row.
pub const DEFAULT_NOT_FOUND_EXPIRY: Duration = Duration::from_secs(60);
/// Default relative jitter applied to [`DEFAULT_EXPIRY`].
pub const DEFAULT_EXPIRY_DEVIATION: f64 = 0.05;

/// Per-node cache behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheOptions {
  pub(crate) expiry: Duration,
  pub(crate) not_found_expiry: Duration,
  pub(crate) expiry_deviation: f64,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      expiry: DEFAULT_EXPIRY,
      not_found_expiry: DEFAULT_NOT_FOUND_EXPIRY,
      expiry_deviation: DEFAULT_EXPIRY_DEVIATION,
    }
  }
}

impl CacheOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sets the lifetime of entries written by `set` and `take`.
  ///
  /// A zero duration stores them without expiry.
  pub fn expiry(mut self, expiry: Duration) -> Self {
    self.expiry = expiry;
    self
  }

  /// Sets how long a "source has no such row" placeholder is kept.
  ///
  /// A zero duration disables placeholders: every miss queries the source.
  pub fn not_found_expiry(mut self, expiry: Duration) -> Self {
    self.not_found_expiry = expiry;
    self
  }

  /// Sets the relative jitter (`0.05` is ±5%) applied to the default expiry,
  /// so that entries filled together do not expire together.
  pub fn expiry_deviation(mut self, deviation: f64) -> Self {
    self.expiry_deviation = deviation;
    self
  }

  pub fn get_expiry(&self) -> Duration {
    self.expiry
  }

  pub fn get_not_found_expiry(&self) -> Duration {
    self.not_found_expiry
  }

  pub fn get_expiry_deviation(&self) -> f64 {
    self.expiry_deviation
  }
}
