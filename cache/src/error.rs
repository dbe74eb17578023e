use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A boxed, thread-safe error, as returned by caller-supplied query functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A specialized `Result` type for cache operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// The "no such entry" sentinel.
///
/// A `NotFound` has identity: two sentinels created by separate calls to
/// [`NotFound::new`] are different even when their messages match. Nodes and
/// clusters are handed the sentinel they should report and recognize, so
/// independently configured clusters never confuse each other's errors.
#[derive(Debug, Clone)]
pub struct NotFound {
  message: Arc<str>,
}

impl NotFound {
  pub fn new(message: impl Into<Arc<str>>) -> Self {
    Self {
      message: message.into(),
    }
  }

  /// Returns true if `other` is this very sentinel (or a clone of it).
  #[inline]
  pub fn is(&self, other: &NotFound) -> bool {
    Arc::ptr_eq(&self.message, &other.message)
  }

  pub fn message(&self) -> &str {
    &self.message
  }
}

impl Default for NotFound {
  fn default() -> Self {
    Self::new("cache entry not found")
  }
}

impl PartialEq for NotFound {
  fn eq(&self, other: &Self) -> bool {
    self.is(other)
  }
}

impl Eq for NotFound {}

impl fmt::Display for NotFound {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.message)
  }
}

impl StdError for NotFound {}

/// Failures reported by a [`Storage`](crate::Storage) collaborator.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
  /// The backend could not be reached or refused the request.
  #[error("storage unavailable: {0}")]
  Unavailable(String),

  /// Any other backend failure, with its original cause.
  #[error("storage backend error: {0}")]
  Backend(#[source] Arc<dyn StdError + Send + Sync>),

  /// A multi-key request partially failed. Keys not listed succeeded.
  #[error("{} key(s) failed in storage", .0.len())]
  PerKey(Vec<(String, StorageError)>),
}

impl StorageError {
  pub fn backend<E: Into<BoxError>>(err: E) -> Self {
    StorageError::Backend(Arc::from(err.into()))
  }
}

/// The error type for all node and cluster operations.
///
/// Every variant is cheap to clone, since one coalesced load result is handed
/// to every task that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
  /// No cached entry, or the key cannot be routed to any node.
  #[error(transparent)]
  NotFound(#[from] NotFound),

  /// The cluster or ring was misconfigured. Raised only at construction or
  /// topology changes.
  #[error("invalid cache configuration: {0}")]
  Config(String),

  /// A key in a batch could not be mapped to a node.
  #[error("no cache node available for key {key:?}")]
  Routing { key: String },

  #[error("cache storage failure: {0}")]
  Storage(#[from] StorageError),

  #[error(transparent)]
  Batch(#[from] BatchError),

  /// The caller's query failed while filling the cache. The original error is
  /// kept intact; see [`CacheError::downcast_load`].
  #[error("cache fill query failed: {0}")]
  Load(#[source] Arc<dyn StdError + Send + Sync>),

  #[error("failed to encode or decode cached value: {0}")]
  Codec(#[source] Arc<serde_json::Error>),

  #[error("operation cancelled")]
  Cancelled,

  #[error("operation deadline exceeded")]
  DeadlineExceeded,
}

impl CacheError {
  pub(crate) fn config(message: impl Into<String>) -> Self {
    CacheError::Config(message.into())
  }

  pub(crate) fn load(err: BoxError) -> Self {
    CacheError::Load(Arc::from(err))
  }

  pub(crate) fn codec(err: serde_json::Error) -> Self {
    CacheError::Codec(Arc::new(err))
  }

  /// Recovers the concrete error returned by a failed query function.
  pub fn downcast_load<E: StdError + 'static>(&self) -> Option<&E> {
    match self {
      CacheError::Load(err) => err.downcast_ref::<E>(),
      _ => None,
    }
  }

  /// Returns the sentinel if this is a not-found error.
  pub fn as_not_found(&self) -> Option<&NotFound> {
    match self {
      CacheError::NotFound(sentinel) => Some(sentinel),
      _ => None,
    }
  }

  pub fn as_batch(&self) -> Option<&BatchError> {
    match self {
      CacheError::Batch(batch) => Some(batch),
      _ => None,
    }
  }
}

/// Walks `err` and its `source()` chain looking for `sentinel`.
pub(crate) fn is_sentinel(err: &(dyn StdError + 'static), sentinel: &NotFound) -> bool {
  let mut current = Some(err);
  while let Some(err) = current {
    if let Some(found) = err.downcast_ref::<NotFound>() {
      if found.is(sentinel) {
        return true;
      }
    }
    // `CacheError::NotFound` is transparent, so the sentinel is not its source.
    if let Some(CacheError::NotFound(found)) = err.downcast_ref::<CacheError>() {
      if found.is(sentinel) {
        return true;
      }
    }
    current = err.source();
  }
  false
}

/// One failed key of a multi-key operation.
#[derive(Debug, Clone)]
pub struct KeyError {
  pub key: String,
  pub error: CacheError,
}

/// The composite result of a multi-key operation.
///
/// An empty `BatchError` means the whole batch succeeded; use
/// [`BatchError::into_result`] to turn it into a `Result`.
#[derive(Debug, Clone, Default)]
pub struct BatchError {
  errors: Vec<KeyError>,
}

impl BatchError {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, key: impl Into<String>, error: CacheError) {
    self.errors.push(KeyError {
      key: key.into(),
      error,
    });
  }

  /// Folds another operation's failure into this batch.
  ///
  /// Nested batches are flattened. Any other error is attributed to every key
  /// in `keys`, the keys that were sent together in the failed call.
  pub(crate) fn absorb(&mut self, keys: &[&str], error: CacheError) {
    match error {
      CacheError::Batch(nested) => self.errors.extend(nested.errors),
      other => {
        for key in keys {
          self.add(*key, other.clone());
        }
      }
    }
  }

  pub fn is_empty(&self) -> bool {
    self.errors.is_empty()
  }

  pub fn len(&self) -> usize {
    self.errors.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &KeyError> {
    self.errors.iter()
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.errors.iter().map(|e| e.key.as_str())
  }

  pub fn error_for(&self, key: &str) -> Option<&CacheError> {
    self.errors.iter().find(|e| e.key == key).map(|e| &e.error)
  }

  pub fn into_errors(self) -> Vec<KeyError> {
    self.errors
  }

  pub fn into_result(self) -> Result<()> {
    if self.errors.is_empty() {
      Ok(())
    } else {
      Err(CacheError::Batch(self))
    }
  }
}

impl fmt::Display for BatchError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} key(s) failed", self.errors.len())?;
    for (i, err) in self.errors.iter().enumerate() {
      let sep = if i == 0 { ": " } else { "; " };
      write!(f, "{}{:?}: {}", sep, err.key, err.error)?;
    }
    Ok(())
  }
}

impl StdError for BatchError {}
