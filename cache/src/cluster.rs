use crate::cache::Cache;
use crate::config::{validate, NodeConf};
use crate::context::Context;
use crate::error::{is_sentinel, BatchError, BoxError, CacheError, NotFound, Result};
use crate::loader::CoalescingLoader;
use crate::metrics::{Stat, StatSnapshot};
use crate::node::{resolve_spawner, CacheNode, Encoded, NodeBuilder};
use crate::options::CacheOptions;
use crate::ring::{HashRing, DEFAULT_REPLICAS};
use crate::runtime::TaskSpawner;
use crate::storage::Storage;

use core::fmt;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ahash::HashMap;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A builder for [`CacheCluster`].
///
/// ```no_run
/// # use fibre_cluster::{ClusterBuilder, CacheOptions, MemoryStorage, NodeConf, NotFound};
/// # use std::time::Duration;
/// # async fn demo() -> fibre_cluster::Result<()> {
/// let conf = vec![NodeConf::new("a", ()), NodeConf::new("b", ()).with_weight(200)];
/// let cluster = ClusterBuilder::new(NotFound::new("no such row"))
///   .options(CacheOptions::new().expiry(Duration::from_secs(3600)))
///   .build(&conf, |_| Ok(MemoryStorage::new()))?;
/// # Ok(())
/// # }
/// ```
pub struct ClusterBuilder {
  not_found: NotFound,
  options: CacheOptions,
  replicas: usize,
  spawner: Option<Arc<dyn TaskSpawner>>,
  stat: Option<Arc<Stat>>,
  report_interval: Option<Duration>,
}

impl fmt::Debug for ClusterBuilder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ClusterBuilder")
      .field("not_found", &self.not_found)
      .field("options", &self.options)
      .field("replicas", &self.replicas)
      .field("report_interval", &self.report_interval)
      .finish_non_exhaustive()
  }
}

impl ClusterBuilder {
  pub fn new(not_found: NotFound) -> Self {
    Self {
      not_found,
      options: CacheOptions::default(),
      replicas: DEFAULT_REPLICAS,
      spawner: None,
      stat: None,
      report_interval: None,
    }
  }

  /// Options applied to every node.
  pub fn options(mut self, options: CacheOptions) -> Self {
    self.options = options;
    self
  }

  /// Virtual ring positions per unit of node weight.
  pub fn replicas(mut self, replicas: usize) -> Self {
    self.replicas = replicas;
    self
  }

  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  /// Counters shared by every node. Defaults to a fresh `Stat`.
  pub fn stat(mut self, stat: Arc<Stat>) -> Self {
    self.stat = Some(stat);
    self
  }

  /// Logs the cluster's hit ratio and traffic every `interval`.
  pub fn report_interval(mut self, interval: Duration) -> Self {
    self.report_interval = Some(interval);
    self
  }

  /// Builds a cluster from `conf`, creating each node's storage with
  /// `factory`.
  ///
  /// The configuration is validated before any storage is created. Nodes with
  /// weight zero are left out.
  pub fn build<S, C, F>(self, conf: &[NodeConf<C>], mut factory: F) -> Result<CacheCluster<S>>
  where
    S: Storage,
    F: FnMut(&NodeConf<C>) -> Result<S>,
  {
    validate(conf)?;
    if self.replicas == 0 {
      return Err(CacheError::config("replicas must be greater than zero"));
    }

    let spawner = resolve_spawner(self.spawner)?;
    let stat = self
      .stat
      .unwrap_or_else(|| Arc::new(Stat::new("cache-cluster")));
    if let Some(interval) = self.report_interval {
      stat.spawn_reporter(&*spawner, interval);
    }

    let cluster = CacheCluster {
      ring: HashRing::with_replicas(self.replicas),
      not_found: self.not_found,
      options: self.options,
      loader: Arc::new(CoalescingLoader::new(spawner)),
      stat,
    };

    let mut members = Vec::with_capacity(conf.len());
    for node in conf {
      if node.weight == 0 {
        tracing::warn!(node = %node.name, "skipping cache node with zero weight");
        continue;
      }
      let storage = factory(node)?;
      members.push((Arc::new(cluster.make_node(&node.name, Arc::new(storage))?), node.weight));
    }
    cluster.ring.extend(members)?;

    tracing::debug!(nodes = cluster.ring.len(), "cache cluster ready");
    Ok(cluster)
  }
}

/// Cache nodes addressed by consistent hashing.
///
/// Every key lives on exactly one node. Single-key operations are forwarded
/// to that node; multi-key deletes are split by node and run concurrently,
/// with failures reported per key.
pub struct CacheCluster<S> {
  ring: HashRing<Arc<CacheNode<S>>>,
  not_found: NotFound,
  options: CacheOptions,
  loader: Arc<CoalescingLoader<Encoded>>,
  stat: Arc<Stat>,
}

impl<S> fmt::Debug for CacheCluster<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheCluster")
      .field("ring", &self.ring)
      .field("not_found", &self.not_found)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}

impl<S: Storage> CacheCluster<S> {
  /// Builds a cluster with default options. See [`ClusterBuilder::build`].
  pub fn new<C, F>(conf: &[NodeConf<C>], factory: F, not_found: NotFound) -> Result<Self>
  where
    F: FnMut(&NodeConf<C>) -> Result<S>,
  {
    ClusterBuilder::new(not_found).build(conf, factory)
  }

  pub fn builder(not_found: NotFound) -> ClusterBuilder {
    ClusterBuilder::new(not_found)
  }

  fn make_node(&self, name: &str, storage: Arc<S>) -> Result<CacheNode<S>> {
    NodeBuilder::with_shared_storage(name, storage)
      .options(self.options.clone())
      .not_found(self.not_found.clone())
      .stat(self.stat.clone())
      .loader(self.loader.clone())
      .build()
  }

  /// Adds a node, or replaces the node of the same name. Keys move to it
  /// immediately.
  pub fn add_node(&self, name: &str, storage: S, weight: u32) -> Result<()> {
    let node = self.make_node(name, Arc::new(storage))?;
    self.ring.add_with_weight(Arc::new(node), weight)?;
    tracing::info!(node = name, weight, "cache node added");
    Ok(())
  }

  /// Removes a node. Its keys are redistributed over the remaining nodes.
  pub fn remove_node(&self, name: &str) -> bool {
    let removed = self.ring.remove(name);
    if removed {
      tracing::info!(node = name, "cache node removed");
    }
    removed
  }

  pub fn node(&self, name: &str) -> Option<Arc<CacheNode<S>>> {
    self.ring.node(name)
  }

  /// The node that owns `key`.
  pub fn node_for(&self, key: &str) -> Option<Arc<CacheNode<S>>> {
    self.ring.get(key)
  }

  /// The `(name, weight)` of every node.
  pub fn nodes(&self) -> Vec<(String, u32)> {
    self.ring.nodes()
  }

  pub fn ring(&self) -> &HashRing<Arc<CacheNode<S>>> {
    &self.ring
  }

  pub fn not_found_error(&self) -> &NotFound {
    &self.not_found
  }

  /// Counters summed over every node.
  pub fn stat(&self) -> StatSnapshot {
    self.stat.snapshot()
  }

  fn route(&self, key: &str) -> Result<Arc<CacheNode<S>>> {
    self
      .ring
      .get(key)
      .ok_or_else(|| CacheError::NotFound(self.not_found.clone()))
  }

  async fn del_many(&self, ctx: &Context, keys: &[&str]) -> Result<()> {
    let mut batch = BatchError::new();
    let mut groups: Vec<(Arc<CacheNode<S>>, Vec<&str>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::default();

    for &key in keys {
      let Some(node) = self.ring.get(key) else {
        batch.add(key, CacheError::Routing { key: key.to_owned() });
        continue;
      };
      match index.get(node.name()) {
        Some(&i) => groups[i].1.push(key),
        None => {
          index.insert(node.name().to_owned(), groups.len());
          groups.push((node, vec![key]));
        }
      }
    }

    let results = join_all(groups.iter().map(|(node, keys)| node.del_ctx(ctx, keys))).await;
    for ((node, keys), result) in groups.iter().zip(results) {
      if let Err(err) = result {
        tracing::debug!(node = node.name(), keys = keys.len(), error = %err, "batch delete failed on node");
        batch.absorb(keys, err);
      }
    }
    batch.into_result()
  }
}

impl<S: Storage> Cache for CacheCluster<S> {
  async fn get_ctx<T>(&self, ctx: &Context, key: &str) -> Result<T>
  where
    T: DeserializeOwned + Send,
  {
    self.route(key)?.get_ctx(ctx, key).await
  }

  async fn set_ctx<T>(&self, ctx: &Context, key: &str, val: &T) -> Result<()>
  where
    T: Serialize + Sync + ?Sized,
  {
    self.route(key)?.set_ctx(ctx, key, val).await
  }

  async fn set_with_expire_ctx<T>(&self, ctx: &Context, key: &str, val: &T, ttl: Duration) -> Result<()>
  where
    T: Serialize + Sync + ?Sized,
  {
    self.route(key)?.set_with_expire_ctx(ctx, key, val, ttl).await
  }

  async fn del_ctx(&self, ctx: &Context, keys: &[&str]) -> Result<()> {
    match keys {
      [] => Ok(()),
      [key] => self.route(key)?.del_ctx(ctx, keys).await,
      _ => ctx.run(self.del_many(ctx, keys)).await,
    }
  }

  async fn take_ctx<T, F, Fut, E>(&self, ctx: &Context, key: &str, query: F) -> Result<T>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = std::result::Result<Option<T>, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
  {
    self.route(key)?.take_ctx(ctx, key, query).await
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
    self.route(key)?.take_with_expire_ctx(ctx, key, ttl, query).await
  }

  fn is_not_found(&self, err: &(dyn StdError + 'static)) -> bool {
    is_sentinel(err, &self.not_found)
  }
}
