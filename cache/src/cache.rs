use crate::context::Context;
use crate::error::{BoxError, Result};

use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// The cache-aside contract shared by a single [`CacheNode`](crate::CacheNode)
/// and a sharded [`CacheCluster`](crate::CacheCluster).
///
/// Each operation comes in two forms: a `*_ctx` form that stops when its
/// [`Context`] is cancelled or its deadline passes, and a plain form that runs
/// with [`Context::background`].
pub trait Cache: Send + Sync {
  /// Reads `key` and decodes it into a `T`.
  ///
  /// A key with no entry fails with the configured not-found sentinel (see
  /// [`Cache::is_not_found`]); an unreachable store fails with a storage
  /// error instead.
  fn get_ctx<T>(&self, ctx: &Context, key: &str) -> impl Future<Output = Result<T>> + Send
  where
    T: DeserializeOwned + Send;

  /// Writes `val` under `key` with the default expiry.
  fn set_ctx<T>(&self, ctx: &Context, key: &str, val: &T) -> impl Future<Output = Result<()>> + Send
  where
    T: Serialize + Sync + ?Sized;

  /// Writes `val` under `key`, expiring after `ttl`. A zero `ttl` never
  /// expires.
  fn set_with_expire_ctx<T>(
    &self,
    ctx: &Context,
    key: &str,
    val: &T,
    ttl: Duration,
  ) -> impl Future<Output = Result<()>> + Send
  where
    T: Serialize + Sync + ?Sized;

  /// Deletes `keys`. Failures are reported per key.
  fn del_ctx(&self, ctx: &Context, keys: &[&str]) -> impl Future<Output = Result<()>> + Send;

  /// Returns the cached value for `key`, or runs `query` to load it, caches
  /// the result with the default expiry, and returns it.
  ///
  /// `query` answers `Ok(None)` when the source of truth has no such row.
  /// Concurrent misses on the same key share a single `query` call.
  fn take_ctx<T, F, Fut, E>(
    &self,
    ctx: &Context,
    key: &str,
    query: F,
  ) -> impl Future<Output = Result<T>> + Send
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static;

  /// Like [`Cache::take_ctx`], but caches the loaded value for `ttl`.
  ///
  /// `query` is called with `ttl`.
  fn take_with_expire_ctx<T, F, Fut, E>(
    &self,
    ctx: &Context,
    key: &str,
    ttl: Duration,
    query: F,
  ) -> impl Future<Output = Result<T>> + Send
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(Duration) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static;

  /// Returns true if `err`, or any error it wraps, is this cache's
  /// not-found sentinel.
  fn is_not_found(&self, err: &(dyn StdError + 'static)) -> bool;

  fn get<T>(&self, key: &str) -> impl Future<Output = Result<T>> + Send
  where
    T: DeserializeOwned + Send,
  {
    async move { self.get_ctx(&Context::background(), key).await }
  }

  fn set<T>(&self, key: &str, val: &T) -> impl Future<Output = Result<()>> + Send
  where
    T: Serialize + Sync + ?Sized,
  {
    async move { self.set_ctx(&Context::background(), key, val).await }
  }

  fn set_with_expire<T>(&self, key: &str, val: &T, ttl: Duration) -> impl Future<Output = Result<()>> + Send
  where
    T: Serialize + Sync + ?Sized,
  {
    async move { self.set_with_expire_ctx(&Context::background(), key, val, ttl).await }
  }

  fn del(&self, keys: &[&str]) -> impl Future<Output = Result<()>> + Send {
    async move { self.del_ctx(&Context::background(), keys).await }
  }

  fn take<T, F, Fut, E>(&self, key: &str, query: F) -> impl Future<Output = Result<T>> + Send
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    async move { self.take_ctx(&Context::background(), key, query).await }
  }

  fn take_with_expire<T, F, Fut, E>(
    &self,
    key: &str,
    ttl: Duration,
    query: F,
  ) -> impl Future<Output = Result<T>> + Send
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(Duration) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    async move {
      self
        .take_with_expire_ctx(&Context::background(), key, ttl, query)
        .await
    }
  }
}
