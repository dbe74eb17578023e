//! The storage collaborator contract.
//!
//! A [`Storage`] is the byte-level key/value store behind a single
//! [`CacheNode`](crate::CacheNode): it stores, fetches and deletes encoded
//! values and enforces their expiry. Network transport, persistence and
//! eviction policy all live on the other side of this trait.

mod memory;

pub use memory::MemoryStorage;

use crate::error::StorageError;

use std::future::Future;
use std::time::Duration;

pub trait Storage: Send + Sync + 'static {
  /// Fetches the bytes stored under `key`.
  ///
  /// A missing or expired key is `Ok(None)`. `Err` is reserved for the store
  /// itself failing, so callers can tell "no entry" from "cache tier down".
  fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send;

  /// Stores `value` under `key`. `ttl` of `None` means the entry never expires.
  fn set(
    &self,
    key: &str,
    value: Vec<u8>,
    ttl: Option<Duration>,
  ) -> impl Future<Output = Result<(), StorageError>> + Send;

  /// Deletes `keys`. Deleting a missing key is not an error.
  ///
  /// Stores that can tell which keys failed should report them through
  /// [`StorageError::PerKey`]; any other error is taken to cover every key in
  /// the call.
  fn del(&self, keys: &[&str]) -> impl Future<Output = Result<(), StorageError>> + Send;
}
