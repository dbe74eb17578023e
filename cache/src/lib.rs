//! A sharded cache-aside layer.
//!
//! Keys are spread over a set of independent cache nodes with weighted
//! consistent hashing. Each node reads through to the source of truth on a
//! miss, with concurrent misses for the same key collapsed into one query.
//!
//! # Features
//! - **Weighted Routing**: A [`HashRing`] maps every key to one node, moving only
//!   the keys of a node that joins or leaves.
//! - **Stampede Protection**: A [`CoalescingLoader`] runs one query per key no matter
//!   how many tasks miss at once.
//! - **Penetration Protection**: Rows the source does not have are remembered with a
//!   short-lived placeholder.
//! - **Batch Errors**: Multi-key deletes report exactly which keys failed and why.
//! - **Cancellation**: Every operation has a `*_ctx` form bound to a [`Context`].
//!
//! The storage behind each node is supplied through the [`Storage`] trait;
//! [`MemoryStorage`] is an in-process implementation.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod node;
pub mod options;
pub mod ring;
pub mod runtime;
pub mod storage;

mod rng;

pub use cache::Cache;
pub use cluster::{CacheCluster, ClusterBuilder};
pub use config::{total_weights, ClusterConf, NodeConf};
pub use context::{CancelHandle, Context};
pub use error::{BatchError, BoxError, CacheError, KeyError, NotFound, Result, StorageError};
pub use loader::CoalescingLoader;
pub use metrics::{Stat, StatSnapshot};
pub use node::{CacheNode, NodeBuilder};
pub use options::CacheOptions;
pub use ring::{HashRing, RingNode};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use storage::{MemoryStorage, Storage};
