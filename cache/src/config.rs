use crate::error::{CacheError, Result};
use crate::ring::DEFAULT_WEIGHT;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

fn default_weight() -> u32 {
  DEFAULT_WEIGHT
}

/// One cache node in a cluster configuration.
///
/// `C` holds whatever the storage factory needs to reach the backend. Its
/// fields sit next to `name` and `weight` in the serialized form:
///
/// ```yaml
/// - name: redis-a
///   weight: 200
///   host: 10.0.0.1:6379
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConf<C> {
  pub name: String,
  #[serde(default = "default_weight")]
  pub weight: u32,
  #[serde(flatten)]
  pub storage: C,
}

impl<C> NodeConf<C> {
  pub fn new(name: impl Into<String>, storage: C) -> Self {
    Self {
      name: name.into(),
      weight: DEFAULT_WEIGHT,
      storage,
    }
  }

  pub fn with_weight(mut self, weight: u32) -> Self {
    self.weight = weight;
    self
  }
}

/// The nodes of a cluster.
pub type ClusterConf<C> = Vec<NodeConf<C>>;

/// Sum of the weights of every node.
pub fn total_weights<C>(conf: &[NodeConf<C>]) -> u64 {
  conf.iter().map(|node| u64::from(node.weight)).sum()
}

/// Checks that `conf` can form a cluster: at least one node, a positive
/// total weight, and unique, non-empty names.
pub fn validate<C>(conf: &[NodeConf<C>]) -> Result<()> {
  if conf.is_empty() {
    return Err(CacheError::config("no cache nodes configured"));
  }
  if total_weights(conf) == 0 {
    return Err(CacheError::config("total weight of cache nodes is zero"));
  }

  let mut seen = HashSet::with_capacity(conf.len());
  for node in conf {
    if node.name.is_empty() {
      return Err(CacheError::config("cache node name must not be empty"));
    }
    if !seen.insert(node.name.as_str()) {
      return Err(CacheError::config(format!("duplicate cache node name '{}'", node.name)));
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  use pretty_assertions::assert_eq;

  #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
  struct Endpoint {
    host: String,
  }

  fn parse(yaml: &str) -> ClusterConf<Endpoint> {
    serde_yaml::from_str(yaml).unwrap()
  }

  #[test]
  fn weight_defaults_and_storage_fields_flatten() {
    let conf = parse(
      r#"
- name: a
  host: 10.0.0.1:6379
- name: b
  weight: 200
  host: 10.0.0.2:6379
"#,
    );
    assert_eq!(
      conf,
      vec![
        NodeConf {
          name: "a".into(),
          weight: 100,
          storage: Endpoint { host: "10.0.0.1:6379".into() },
        },
        NodeConf {
          name: "b".into(),
          weight: 200,
          storage: Endpoint { host: "10.0.0.2:6379".into() },
        },
      ]
    );
    assert_eq!(total_weights(&conf), 300);
    assert!(validate(&conf).is_ok());
  }

  #[test]
  fn rejects_unusable_clusters() {
    let empty: ClusterConf<Endpoint> = vec![];
    assert!(matches!(validate(&empty), Err(CacheError::Config(_))));

    let weightless = parse(
      r#"
- name: a
  weight: 0
  host: h
"#,
    );
    assert!(matches!(validate(&weightless), Err(CacheError::Config(_))));

    let duplicated = parse(
      r#"
- name: a
  host: h1
- name: a
  host: h2
"#,
    );
    let err = validate(&duplicated).unwrap_err();
    assert_eq!(err.to_string(), "invalid cache configuration: duplicate cache node name 'a'");

    let unnamed = vec![NodeConf::new("", Endpoint { host: "h".into() })];
    assert!(matches!(validate(&unnamed), Err(CacheError::Config(_))));
  }
}
