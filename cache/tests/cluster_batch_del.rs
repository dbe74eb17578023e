mod common;

use common::FlakyStorage;

use fibre_cluster::{Cache, CacheCluster, CacheError, NodeConf, NotFound};

fn cluster() -> CacheCluster<FlakyStorage> {
  let conf = vec![
    NodeConf::new("a", ()),
    NodeConf::new("b", ()),
    NodeConf::new("c", ()).with_weight(200),
  ];
  CacheCluster::new(&conf, |_| Ok(FlakyStorage::new()), NotFound::default()).unwrap()
}

async fn fill(cluster: &CacheCluster<FlakyStorage>, keys: &[&str]) {
  for key in keys {
    cluster.set(key, &format!("value of {key}")).await.unwrap();
  }
}

#[tokio::test]
async fn test_empty_and_single_key_deletes() {
  let cluster = cluster();
  assert!(cluster.del(&[]).await.is_ok());

  fill(&cluster, &["solo"]).await;
  cluster.del(&["solo"]).await.unwrap();
  assert!(cluster.is_not_found(&cluster.get::<String>("solo").await.unwrap_err()));
}

#[tokio::test]
async fn test_delete_spans_every_node() {
  let cluster = cluster();
  let keys: Vec<String> = (0..200).map(|i| format!("key:{i}")).collect();
  let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
  fill(&cluster, &keys).await;

  let owners: std::collections::HashSet<String> = keys
    .iter()
    .map(|k| cluster.node_for(k).unwrap().name().to_owned())
    .collect();
  assert_eq!(owners.len(), 3, "keys should land on every node");

  cluster.del(&keys).await.unwrap();
  for (name, _) in cluster.nodes() {
    assert!(cluster.node(&name).unwrap().storage().inner().is_empty());
  }
}

#[tokio::test]
async fn test_partial_failure_names_exactly_the_failing_key() {
  let cluster = cluster();
  let keys = ["a", "b", "c"];
  fill(&cluster, &keys).await;
  cluster.node_for("b").unwrap().storage().fail_key("b");

  let err = cluster.del(&keys).await.unwrap_err();
  let batch = err.as_batch().expect("a batch error");
  assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["b"]);
  assert!(matches!(batch.error_for("b"), Some(CacheError::Storage(_))));
  assert!(err.to_string().contains("\"b\""));

  for key in ["a", "c"] {
    assert!(cluster.is_not_found(&cluster.get::<String>(key).await.unwrap_err()));
  }
  assert_eq!(cluster.get::<String>("b").await.unwrap(), "value of b");
}

#[tokio::test]
async fn test_down_node_fails_only_its_own_keys() {
  let cluster = cluster();
  let keys: Vec<String> = (0..60).map(|i| format!("key:{i}")).collect();
  let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
  fill(&cluster, &keys).await;

  let down = cluster.node("c").unwrap();
  down.storage().set_down(true);
  let expected: Vec<&str> = keys
    .iter()
    .copied()
    .filter(|k| cluster.node_for(k).unwrap().name() == "c")
    .collect();
  assert!(!expected.is_empty());

  let err = cluster.del(&keys).await.unwrap_err();
  let batch = err.as_batch().unwrap();
  let mut failed: Vec<&str> = batch.keys().collect();
  failed.sort_unstable();
  let mut expected = expected;
  expected.sort_unstable();
  assert_eq!(failed, expected);
  assert!(batch
    .iter()
    .all(|e| matches!(e.error, CacheError::Storage(_))));
}
