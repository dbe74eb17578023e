#![allow(dead_code)]

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibre_cluster::{MemoryStorage, Storage, StorageError};
use parking_lot::Mutex;

/// A `MemoryStorage` that can be told to fail, either as a whole or for
/// selected keys on delete.
#[derive(Debug, Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  down: AtomicBool,
  failing_keys: Mutex<HashSet<String>>,
  pub gets: AtomicUsize,
  pub sets: AtomicUsize,
}

impl FlakyStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn inner(&self) -> &MemoryStorage {
    &self.inner
  }

  pub fn set_down(&self, down: bool) {
    self.down.store(down, Ordering::SeqCst);
  }

  pub fn fail_key(&self, key: &str) {
    self.failing_keys.lock().insert(key.to_owned());
  }

  fn check(&self) -> Result<(), StorageError> {
    if self.down.load(Ordering::SeqCst) {
      Err(StorageError::Unavailable("connection refused".into()))
    } else {
      Ok(())
    }
  }
}

impl Storage for FlakyStorage {
  async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    self.check()?;
    self.inner.get(key).await
  }

  async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), StorageError> {
    self.sets.fetch_add(1, Ordering::SeqCst);
    self.check()?;
    self.inner.set(key, value, ttl).await
  }

  async fn del(&self, keys: &[&str]) -> Result<(), StorageError> {
    self.check()?;
    let failing: Vec<(String, StorageError)> = {
      let failing_keys = self.failing_keys.lock();
      keys
        .iter()
        .filter(|key| failing_keys.contains(**key))
        .map(|key| (key.to_string(), StorageError::Unavailable(format!("cannot delete {key}"))))
        .collect()
    };
    let ok: Vec<&str> = keys
      .iter()
      .copied()
      .filter(|key| !failing.iter().any(|(failed, _)| failed == key))
      .collect();
    self.inner.del(&ok).await?;
    if failing.is_empty() {
      Ok(())
    } else {
      Err(StorageError::PerKey(failing))
    }
  }
}

/// Counts calls of a query function.
#[derive(Debug, Clone, Default)]
pub struct QueryCounter(Arc<AtomicUsize>);

impl QueryCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn calls(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }

  /// A query that returns `value` after `delay`.
  pub fn returning<T: Send + 'static>(
    &self,
    value: Option<T>,
    delay: Duration,
  ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<Option<T>, std::io::Error>> + Send>>
       + Send
       + 'static {
    let counter = self.0.clone();
    move || {
      Box::pin(async move {
        counter.fetch_add(1, Ordering::SeqCst);
        if !delay.is_zero() {
          tokio::time::sleep(delay).await;
        }
        Ok(value)
      })
    }
  }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct User {
  pub id: u64,
  pub name: String,
}

impl User {
  pub fn new(id: u64, name: &str) -> Self {
    Self {
      id,
      name: name.to_owned(),
    }
  }
}
