use crate::cache::Cache;
use crate::context::Context;
use crate::error::{is_sentinel, BatchError, BoxError, CacheError, NotFound, Result, StorageError};
use crate::loader::CoalescingLoader;
use crate::metrics::{Stat, StatSnapshot};
use crate::options::CacheOptions;
use crate::ring::RingNode;
use crate::rng::Unstable;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::storage::Storage;

use core::fmt;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Stored in place of a value when the source of truth has no such row.
/// It can never collide with an encoded value, which is always valid JSON.
const PLACEHOLDER: &[u8] = b"*";

/// The bytes a coalesced fill hands to every waiter.
pub(crate) type Encoded = Arc<[u8]>;

enum Lookup {
  Hit(Vec<u8>),
  Placeholder,
  Miss,
}

/// A single cache endpoint: cache-aside access to one [`Storage`].
pub struct CacheNode<S> {
  name: Arc<str>,
  storage: Arc<S>,
  loader: Arc<CoalescingLoader<Encoded>>,
  not_found: NotFound,
  options: CacheOptions,
  unstable: Unstable,
  stat: Arc<Stat>,
}

impl<S> fmt::Debug for CacheNode<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheNode")
      .field("name", &self.name)
      .field("options", &self.options)
      .field("stat", &self.stat.snapshot())
      .finish_non_exhaustive()
  }
}

impl<S> RingNode for CacheNode<S> {
  fn node_id(&self) -> &str {
    &self.name
  }
}

/// A builder for [`CacheNode`].
pub struct NodeBuilder<S> {
  name: String,
  storage: Arc<S>,
  options: CacheOptions,
  not_found: Option<NotFound>,
  stat: Option<Arc<Stat>>,
  spawner: Option<Arc<dyn TaskSpawner>>,
  loader: Option<Arc<CoalescingLoader<Encoded>>>,
}

impl<S> fmt::Debug for NodeBuilder<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeBuilder")
      .field("name", &self.name)
      .field("options", &self.options)
      .field("has_spawner", &self.spawner.is_some())
      .finish_non_exhaustive()
  }
}

impl<S: Storage> NodeBuilder<S> {
  pub fn new(name: impl Into<String>, storage: S) -> Self {
    Self::with_shared_storage(name, Arc::new(storage))
  }

  pub fn with_shared_storage(name: impl Into<String>, storage: Arc<S>) -> Self {
    Self {
      name: name.into(),
      storage,
      options: CacheOptions::default(),
      not_found: None,
      stat: None,
      spawner: None,
      loader: None,
    }
  }

  pub fn options(mut self, options: CacheOptions) -> Self {
    self.options = options;
    self
  }

  /// Sets the sentinel this node reports for missing entries.
  ///
  /// Defaults to a fresh [`NotFound`] private to this node.
  pub fn not_found(mut self, not_found: NotFound) -> Self {
    self.not_found = Some(not_found);
    self
  }

  /// Shares lookup counters with other nodes.
  pub fn stat(mut self, stat: Arc<Stat>) -> Self {
    self.stat = Some(stat);
    self
  }

  /// Sets where coalesced loads run. Defaults to the current Tokio runtime.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  pub(crate) fn loader(mut self, loader: Arc<CoalescingLoader<Encoded>>) -> Self {
    self.loader = Some(loader);
    self
  }

  pub fn build(self) -> Result<CacheNode<S>> {
    if self.name.is_empty() {
      return Err(CacheError::config("cache node name must not be empty"));
    }
    let loader = match self.loader {
      Some(loader) => loader,
      None => Arc::new(CoalescingLoader::new(resolve_spawner(self.spawner)?)),
    };
    let stat = self
      .stat
      .unwrap_or_else(|| Arc::new(Stat::new(self.name.clone())));

    Ok(CacheNode {
      unstable: Unstable::new(self.options.expiry_deviation),
      name: Arc::from(self.name),
      storage: self.storage,
      loader,
      not_found: self.not_found.unwrap_or_default(),
      options: self.options,
      stat,
    })
  }
}

pub(crate) fn resolve_spawner(spawner: Option<Arc<dyn TaskSpawner>>) -> Result<Arc<dyn TaskSpawner>> {
  match spawner {
    Some(spawner) => Ok(spawner),
    None => TokioSpawner::try_current()
      .map(|s| Arc::new(s) as Arc<dyn TaskSpawner>)
      .ok_or_else(|| CacheError::config("a task spawner is required outside of a Tokio runtime")),
  }
}

#[inline]
fn ttl_of(ttl: Duration) -> Option<Duration> {
  (!ttl.is_zero()).then_some(ttl)
}

fn encode<T: Serialize + ?Sized>(val: &T) -> Result<Vec<u8>> {
  serde_json::to_vec(val).map_err(CacheError::codec)
}

async fn write_placeholder<S: Storage>(storage: &S, node: &str, key: &str, expiry: Duration) {
  if expiry.is_zero() {
    return;
  }
  if let Err(err) = storage.set(key, PLACEHOLDER.to_vec(), Some(expiry)).await {
    tracing::warn!(node, key, error = %err, "failed to cache not-found placeholder");
  }
}

impl<S: Storage> CacheNode<S> {
  pub fn builder(name: impl Into<String>, storage: S) -> NodeBuilder<S> {
    NodeBuilder::new(name, storage)
  }

  /// Creates a node with default options. Must be called inside a Tokio
  /// runtime; use [`NodeBuilder::spawner`] otherwise.
  pub fn new(name: impl Into<String>, storage: S) -> Result<Self> {
    NodeBuilder::new(name, storage).build()
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn not_found_error(&self) -> &NotFound {
    &self.not_found
  }

  pub fn options(&self) -> &CacheOptions {
    &self.options
  }

  pub fn stat(&self) -> StatSnapshot {
    self.stat.snapshot()
  }

  /// Number of fills currently running through this node's loader.
  pub fn loads_in_flight(&self) -> usize {
    self.loader.in_flight()
  }

  fn not_found(&self) -> CacheError {
    CacheError::NotFound(self.not_found.clone())
  }

  /// The jittered default expiry.
  fn default_ttl(&self) -> Option<Duration> {
    ttl_of(self.unstable.around(self.options.expiry))
  }

  async fn lookup(&self, key: &str) -> Result<Lookup> {
    let found = self.storage.get(key).await.inspect_err(|_| self.stat.record_miss());
    match found? {
      None => {
        self.stat.record_miss();
        Ok(Lookup::Miss)
      }
      Some(bytes) => {
        self.stat.record_hit();
        if bytes == PLACEHOLDER {
          Ok(Lookup::Placeholder)
        } else {
          Ok(Lookup::Hit(bytes))
        }
      }
    }
  }

  /// Decodes a cached value. An entry that cannot be decoded is dropped from
  /// storage so the next fill replaces it.
  async fn decode_or_discard<T: DeserializeOwned + Send>(&self, key: &str, bytes: &[u8]) -> Option<T> {
    let err = match serde_json::from_slice::<T>(bytes) {
      Ok(value) => return Some(value),
      Err(err) => err.to_string(),
    };
    tracing::warn!(node = %self.name, key, error = %err, "discarding undecodable cache entry");
    if let Err(err) = self.storage.del(&[key]).await {
      tracing::error!(node = %self.name, key, error = %err, "failed to delete undecodable cache entry");
    }
    None
  }

  async fn write(&self, key: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
    self.storage.set(key, bytes, ttl).await?;
    Ok(())
  }

  async fn do_take<T, F, Fut, E>(&self, key: &str, ttl: Option<Duration>, query: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    match self.lookup(key).await? {
      Lookup::Hit(bytes) => {
        if let Some(value) = self.decode_or_discard(key, &bytes).await {
          return Ok(value);
        }
      }
      Lookup::Placeholder => return Err(self.not_found()),
      Lookup::Miss => {}
    }

    let fill = Fill {
      node: self.name.clone(),
      key: key.to_owned(),
      storage: self.storage.clone(),
      not_found: self.not_found.clone(),
      not_found_expiry: self.options.not_found_expiry,
      stat: self.stat.clone(),
      ttl,
    };
    let (encoded, shared) = self.loader.load(key, move || fill.run::<T, F, Fut, E>(query)).await;
    tracing::trace!(node = %self.name, key, shared, "cache fill finished");

    serde_json::from_slice(&encoded?).map_err(CacheError::codec)
  }
}

/// The state a coalesced fill carries onto its own task.
struct Fill<S> {
  node: Arc<str>,
  key: String,
  storage: Arc<S>,
  not_found: NotFound,
  not_found_expiry: Duration,
  stat: Arc<Stat>,
  ttl: Option<Duration>,
}

impl<S: Storage> Fill<S> {
  async fn run<T, F, Fut, E>(self, query: F) -> Result<Encoded>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    // A flight that finished between our miss and this one may have filled
    // the key already.
    if let Some(bytes) = self.storage.get(&self.key).await? {
      if bytes == PLACEHOLDER {
        return Err(CacheError::NotFound(self.not_found));
      }
      if serde_json::from_slice::<T>(&bytes).is_ok() {
        return Ok(Arc::from(bytes));
      }
    }

    let outcome: std::result::Result<Option<T>, BoxError> = query().await.map_err(Into::into);
    match outcome {
      Ok(Some(value)) => {
        let bytes = encode(&value)?;
        // The loaded value is authoritative; a failed cache write only costs
        // a future miss.
        if let Err(err) = self.storage.set(&self.key, bytes.clone(), self.ttl).await {
          tracing::error!(node = %self.node, key = %self.key, error = %err, "failed to cache loaded value");
        }
        Ok(Arc::from(bytes))
      }
      Ok(None) => self.missing().await,
      Err(err) if is_sentinel(&*err, &self.not_found) => self.missing().await,
      Err(err) => {
        self.stat.record_db_fail();
        tracing::debug!(node = %self.node, key = %self.key, error = %err, "cache fill query failed");
        Err(CacheError::load(err))
      }
    }
  }

  async fn missing(self) -> Result<Encoded> {
    write_placeholder(&*self.storage, &self.node, &self.key, self.not_found_expiry).await;
    Err(CacheError::NotFound(self.not_found))
  }
}

impl<S: Storage> Cache for CacheNode<S> {
  async fn get_ctx<T>(&self, ctx: &Context, key: &str) -> Result<T>
  where
    T: DeserializeOwned + Send,
  {
    ctx
      .run(async {
        match self.lookup(key).await? {
          Lookup::Hit(bytes) => self
            .decode_or_discard(key, &bytes)
            .await
            .ok_or_else(|| self.not_found()),
          Lookup::Placeholder | Lookup::Miss => Err(self.not_found()),
        }
      })
      .await
  }

  async fn set_ctx<T>(&self, ctx: &Context, key: &str, val: &T) -> Result<()>
  where
    T: Serialize + Sync + ?Sized,
  {
    let bytes = encode(val)?;
    ctx.run(self.write(key, bytes, self.default_ttl())).await
  }

  async fn set_with_expire_ctx<T>(&self, ctx: &Context, key: &str, val: &T, ttl: Duration) -> Result<()>
  where
    T: Serialize + Sync + ?Sized,
  {
    let bytes = encode(val)?;
    ctx.run(self.write(key, bytes, ttl_of(ttl))).await
  }

  async fn del_ctx(&self, ctx: &Context, keys: &[&str]) -> Result<()> {
    if keys.is_empty() {
      return Ok(());
    }
    ctx
      .run(async {
        match self.storage.del(keys).await {
          Ok(()) => Ok(()),
          Err(StorageError::PerKey(failed)) => {
            let mut batch = BatchError::new();
            for (key, err) in failed {
              batch.add(key, CacheError::Storage(err));
            }
            batch.into_result()
          }
          Err(err) if keys.len() == 1 => Err(CacheError::Storage(err)),
          Err(err) => {
            let mut batch = BatchError::new();
            batch.absorb(keys, CacheError::Storage(err));
            batch.into_result()
          }
        }
      })
      .await
  }

  async fn take_ctx<T, F, Fut, E>(&self, ctx: &Context, key: &str, query: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    ctx.run(self.do_take(key, self.default_ttl(), query)).await
  }

  async fn take_with_expire_ctx<T, F, Fut, E>(
    &self,
    ctx: &Context,
    key: &str,
    ttl: Duration,
    query: F,
  ) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce(Duration) -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    ctx.run(self.do_take(key, ttl_of(ttl), move || query(ttl))).await
  }

  fn is_not_found(&self, err: &(dyn StdError + 'static)) -> bool {
    is_sentinel(err, &self.not_found)
  }
}
