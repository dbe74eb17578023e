use crate::error::StorageError;
use crate::storage::Storage;

use core::fmt;
use std::collections::HashMap;
use std::time::Duration;

use ahash::RandomState;
use crossbeam_utils::CachePadded;
use parking_lot::RwLock;
use tokio::time::Instant;

/// A stored value and its expiry instant. `None` means no TTL.
#[derive(Debug, Clone)]
struct StoredEntry {
  value: Vec<u8>,
  expires_at: Option<Instant>,
}

impl StoredEntry {
  fn new(value: Vec<u8>, ttl: Option<Duration>, now: Instant) -> Self {
    Self {
      value,
      // A ttl past the clock's range never expires.
      expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
    }
  }

  #[inline]
  fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }
}

type Shard = RwLock<HashMap<String, StoredEntry, RandomState>>;

/// An in-process, sharded [`Storage`] with lazy TTL expiry.
///
/// Expired entries are invisible to reads and are dropped the next time they
/// are touched, or in bulk by [`MemoryStorage::purge_expired`]. Time comes
/// from `tokio::time`, so a paused test clock drives expiry too.
pub struct MemoryStorage {
  shards: Box<[CachePadded<Shard>]>,
  hasher: RandomState,
}

impl fmt::Debug for MemoryStorage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MemoryStorage")
      .field("num_shards", &self.shards.len())
      .finish_non_exhaustive()
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::with_shards(num_cpus::get() * 4)
  }

  /// Creates a store split into `shards` independently locked partitions,
  /// rounded up to a power of two.
  pub fn with_shards(shards: usize) -> Self {
    let shards = shards.max(1).next_power_of_two();
    let hasher = RandomState::new();
    let shards = (0..shards)
      .map(|_| CachePadded::new(RwLock::new(HashMap::with_hasher(hasher.clone()))))
      .collect();
    Self { shards, hasher }
  }

  #[inline]
  fn shard(&self, key: &str) -> &Shard {
    let hash = self.hasher.hash_one(key);
    &self.shards[hash as usize & (self.shards.len() - 1)]
  }

  /// Number of live (unexpired) entries.
  pub fn len(&self) -> usize {
    let now = Instant::now();
    self
      .shards
      .iter()
      .map(|shard| shard.read().values().filter(|e| !e.is_expired(now)).count())
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn contains_key(&self, key: &str) -> bool {
    let now = Instant::now();
    self
      .shard(key)
      .read()
      .get(key)
      .is_some_and(|e| !e.is_expired(now))
  }

  /// Time left before `key` expires.
  ///
  /// `None` if the key is absent or expired, `Some(None)` if it never expires.
  pub fn remaining_ttl(&self, key: &str) -> Option<Option<Duration>> {
    let now = Instant::now();
    let guard = self.shard(key).read();
    let entry = guard.get(key).filter(|e| !e.is_expired(now))?;
    Some(entry.expires_at.map(|at| at.saturating_duration_since(now)))
  }

  /// Drops every expired entry and returns how many were removed.
  pub fn purge_expired(&self) -> usize {
    let now = Instant::now();
    let mut removed = 0;
    for shard in self.shards.iter() {
      let mut guard = shard.write();
      let before = guard.len();
      guard.retain(|_, e| !e.is_expired(now));
      removed += before - guard.len();
    }
    removed
  }

  pub fn clear(&self) {
    for shard in self.shards.iter() {
      shard.write().clear();
    }
  }
}

impl Storage for MemoryStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let now = Instant::now();
    let shard = self.shard(key);
    {
      let guard = shard.read();
      match guard.get(key) {
        None => return Ok(None),
        Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
        Some(_) => {}
      }
    }

    let mut guard = shard.write();
    if guard.get(key).is_some_and(|e| e.is_expired(now)) {
      guard.remove(key);
    }
    Ok(None)
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
    let entry = StoredEntry::new(value, ttl, Instant::now());
    self.shard(key).write().insert(key.to_owned(), entry);
    Ok(())
  }

  async fn del(&self, keys: &[&str]) -> Result<(), StorageError> {
    for key in keys {
      self.shard(key).write().remove(*key);
    }
    Ok(())
  }
}
