//! Weighted consistent hashing.
//!
//! Every registered node owns `weight × replicas` virtual positions on a
//! 64-bit ring, derived by hashing `"{node_id}#{replica}"`. A key belongs to
//! the node owning the first position at or after the key's own hash, wrapping
//! around past the largest position. Adding or removing a node only moves the
//! keys adjacent to that node's positions.
//!
//! The position table is an immutable, sorted array. Topology changes build a
//! new table and swap it in, so lookups never observe a half-built ring and
//! never wait on each other.

use crate::error::{CacheError, Result};

use core::fmt;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Weight given to nodes added without one.
pub const DEFAULT_WEIGHT: u32 = 100;
/// Virtual positions per unit of weight.
pub const DEFAULT_REPLICAS: usize = 10;
/// Upper bound on the positions of a whole ring.
pub const MAX_VIRTUAL_NODES: usize = 1 << 24;

/// A hash function mapping bytes onto the ring.
pub type HashFn = fn(&[u8]) -> u64;

/// The default ring hash. Its output is stable across processes and
/// platforms, which routing agreement between clients depends on.
#[inline]
pub fn default_hash(data: &[u8]) -> u64 {
  rapidhash::rapidhash(data)
}

/// Something that can be placed on a [`HashRing`].
///
/// The id must be stable and unique within a ring: it seeds the node's ring
/// positions, and re-adding an id replaces the previous node.
pub trait RingNode {
  fn node_id(&self) -> &str;
}

impl RingNode for String {
  fn node_id(&self) -> &str {
    self
  }
}

impl RingNode for &'static str {
  fn node_id(&self) -> &str {
    self
  }
}

impl<T: RingNode + ?Sized> RingNode for Arc<T> {
  fn node_id(&self) -> &str {
    (**self).node_id()
  }
}

#[derive(Clone)]
struct Member<N> {
  id: String,
  node: N,
  weight: u32,
}

struct Table<N> {
  members: Vec<Member<N>>,
  /// `(position, member index)`, sorted by position then member id.
  points: Vec<(u64, u32)>,
}

impl<N> Table<N> {
  fn empty() -> Self {
    Self {
      members: Vec::new(),
      points: Vec::new(),
    }
  }

  fn build(members: Vec<Member<N>>, replicas: usize, hash: HashFn) -> Self {
    let total: usize = members.iter().map(|m| m.weight as usize * replicas).sum();
    let mut points = Vec::with_capacity(total);
    let mut label = String::new();
    for (index, member) in members.iter().enumerate() {
      for replica in 0..member.weight as usize * replicas {
        label.clear();
        let _ = write!(label, "{}#{}", member.id, replica);
        points.push((hash(label.as_bytes()), index as u32));
      }
    }
    // Colliding positions are ordered by id, not by insertion order.
    points.sort_unstable_by(|a, b| {
      a.0
        .cmp(&b.0)
        .then_with(|| members[a.1 as usize].id.cmp(&members[b.1 as usize].id))
    });
    Self { members, points }
  }

  #[inline]
  fn locate(&self, hash: u64) -> Option<&Member<N>> {
    if self.points.is_empty() {
      return None;
    }
    let mut index = self.points.partition_point(|&(position, _)| position < hash);
    if index == self.points.len() {
      index = 0;
    }
    Some(&self.members[self.points[index].1 as usize])
  }
}

/// A weighted consistent-hash ring of `N` handles.
pub struct HashRing<N> {
  replicas: usize,
  hash: HashFn,
  table: RwLock<Arc<Table<N>>>,
  // Serializes topology changes; lookups only touch `table`.
  writer: Mutex<()>,
}

impl<N> fmt::Debug for HashRing<N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let table = self.table.read().clone();
    f.debug_struct("HashRing")
      .field("replicas", &self.replicas)
      .field("nodes", &table.members.len())
      .field("virtual_nodes", &table.points.len())
      .finish()
  }
}

impl<N: RingNode + Clone> Default for HashRing<N> {
  fn default() -> Self {
    Self::new()
  }
}

impl<N: RingNode + Clone> HashRing<N> {
  pub fn new() -> Self {
    Self::with_replicas(DEFAULT_REPLICAS)
  }

  /// Creates a ring with `replicas` virtual positions per unit of weight.
  pub fn with_replicas(replicas: usize) -> Self {
    Self::with_hasher(replicas, default_hash)
  }

  pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
    Self {
      replicas: replicas.max(1),
      hash,
      table: RwLock::new(Arc::new(Table::empty())),
      writer: Mutex::new(()),
    }
  }

  pub fn replicas(&self) -> usize {
    self.replicas
  }

  #[inline]
  fn current(&self) -> Arc<Table<N>> {
    self.table.read().clone()
  }

  #[inline]
  fn positions(&self, weight: u32) -> usize {
    (weight as usize).saturating_mul(self.replicas)
  }

  fn validate(&self, node: &N, weight: u32) -> Result<()> {
    if node.node_id().is_empty() {
      return Err(CacheError::config("ring node id must not be empty"));
    }
    if weight == 0 {
      return Err(CacheError::config(format!(
        "node {:?} must have a positive weight",
        node.node_id()
      )));
    }
    if self.positions(weight) > MAX_VIRTUAL_NODES {
      return Err(CacheError::config(format!(
        "node {:?} weight {} is too large",
        node.node_id(),
        weight
      )));
    }
    Ok(())
  }

  /// Adds `node` with [`DEFAULT_WEIGHT`].
  pub fn add(&self, node: N) -> Result<()> {
    self.add_with_weight(node, DEFAULT_WEIGHT)
  }

  /// Adds `node` with `weight × replicas` virtual positions, replacing any
  /// node already registered under the same id.
  pub fn add_with_weight(&self, node: N, weight: u32) -> Result<()> {
    self.extend(std::iter::once((node, weight)))
  }

  /// Adds several nodes with a single table rebuild.
  ///
  /// Nothing is added unless every node is valid.
  pub fn extend<I>(&self, nodes: I) -> Result<()>
  where
    I: IntoIterator<Item = (N, u32)>,
  {
    let added: Vec<(N, u32)> = nodes.into_iter().collect();
    for (node, weight) in &added {
      self.validate(node, *weight)?;
    }
    if added.is_empty() {
      return Ok(());
    }

    let _guard = self.writer.lock();
    let mut members: Vec<Member<N>> = self.current().members.clone();
    for (node, weight) in added {
      let id = node.node_id().to_owned();
      members.retain(|m| m.id != id);
      members.push(Member { id, node, weight });
    }
    let total = members
      .iter()
      .fold(0usize, |sum, m| sum.saturating_add(self.positions(m.weight)));
    if total > MAX_VIRTUAL_NODES {
      return Err(CacheError::config(format!(
        "ring would hold {total} virtual nodes, more than {MAX_VIRTUAL_NODES}"
      )));
    }
    self.install(members);
    Ok(())
  }

  /// Removes the node registered as `node_id`. Returns false if there was none.
  pub fn remove(&self, node_id: &str) -> bool {
    let _guard = self.writer.lock();
    let current = self.current();
    if !current.members.iter().any(|m| m.id == node_id) {
      return false;
    }
    let members = current
      .members
      .iter()
      .filter(|m| m.id != node_id)
      .cloned()
      .collect();
    self.install(members);
    true
  }

  fn install(&self, members: Vec<Member<N>>) {
    let table = Arc::new(Table::build(members, self.replicas, self.hash));
    *self.table.write() = table;
  }

  /// Returns the node owning `key`, or `None` if the ring is empty.
  pub fn get(&self, key: &str) -> Option<N> {
    let hash = (self.hash)(key.as_bytes());
    self.current().locate(hash).map(|m| m.node.clone())
  }

  /// Looks up a registered node by id.
  pub fn node(&self, node_id: &str) -> Option<N> {
    self
      .current()
      .members
      .iter()
      .find(|m| m.id == node_id)
      .map(|m| m.node.clone())
  }

  pub fn contains(&self, node_id: &str) -> bool {
    self.current().members.iter().any(|m| m.id == node_id)
  }

  /// The `(id, weight)` of every registered node, in registration order.
  pub fn nodes(&self) -> Vec<(String, u32)> {
    self
      .current()
      .members
      .iter()
      .map(|m| (m.id.clone(), m.weight))
      .collect()
  }

  pub fn total_weight(&self) -> u64 {
    self.current().members.iter().map(|m| m.weight as u64).sum()
  }

  /// Number of registered nodes.
  pub fn len(&self) -> usize {
    self.current().members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn virtual_nodes(&self) -> usize {
    self.current().points.len()
  }
}
