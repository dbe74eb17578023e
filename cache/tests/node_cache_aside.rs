mod common;

use common::{FlakyStorage, QueryCounter, User};

use std::time::Duration;

use fibre_cluster::{Cache, CacheError, CacheNode, CacheOptions, MemoryStorage, NotFound, Storage, StorageError};

fn node_with(storage: FlakyStorage, not_found: &NotFound) -> CacheNode<FlakyStorage> {
  CacheNode::builder("node-1", storage)
    .not_found(not_found.clone())
    .build()
    .unwrap()
}

#[tokio::test]
async fn test_take_fills_once_then_hits() {
  let sentinel = NotFound::new("no such user");
  let node = node_with(FlakyStorage::new(), &sentinel);
  let counter = QueryCounter::new();

  // 1. Miss: the query runs and its value is cached.
  let user: User = node
    .take("user:1", counter.returning(Some(User::new(1, "ada")), Duration::ZERO))
    .await
    .unwrap();
  assert_eq!(user, User::new(1, "ada"));
  assert_eq!(counter.calls(), 1);

  // 2. Hit: served from the cache, the query is not called.
  let user: User = node
    .take("user:1", counter.returning(Some(User::new(1, "other")), Duration::ZERO))
    .await
    .unwrap();
  assert_eq!(user.name, "ada");
  assert_eq!(counter.calls(), 1);

  let direct: User = node.get("user:1").await.unwrap();
  assert_eq!(direct, user);

  let stat = node.stat();
  assert_eq!(stat.misses, 1);
  assert!(stat.hits >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_set_uses_jittered_default_expiry() {
  let node = CacheNode::new("n", MemoryStorage::new()).unwrap();
  node.set("k", &42u32).await.unwrap();

  let ttl = node.storage().remaining_ttl("k").unwrap().unwrap();
  let week = Duration::from_secs(7 * 24 * 3600);
  assert!(ttl >= week.mul_f64(0.95) && ttl <= week.mul_f64(1.05), "ttl {ttl:?}");
  assert_eq!(node.get::<u32>("k").await.unwrap(), 42);
}

#[tokio::test(start_paused = true)]
async fn test_set_with_expire_is_exact_and_zero_never_expires() {
  let node = CacheNode::new("n", MemoryStorage::new()).unwrap();

  node.set_with_expire("short", "v", Duration::from_secs(30)).await.unwrap();
  assert_eq!(
    node.storage().remaining_ttl("short"),
    Some(Some(Duration::from_secs(30)))
  );

  node.set_with_expire("forever", "v", Duration::ZERO).await.unwrap();
  assert_eq!(node.storage().remaining_ttl("forever"), Some(None));

  tokio::time::advance(Duration::from_secs(31)).await;
  assert!(node.get::<String>("short").await.is_err());
  assert_eq!(node.get::<String>("forever").await.unwrap(), "v");
}

#[tokio::test(start_paused = true)]
async fn test_missing_rows_are_remembered_until_placeholder_expires() {
  let sentinel = NotFound::new("no such user");
  let node = node_with(FlakyStorage::new(), &sentinel);
  let counter = QueryCounter::new();

  // 1. The source has no row: NotFound, and a placeholder is written.
  let err = node
    .take::<User, _, _, _>("user:404", counter.returning(None, Duration::ZERO))
    .await
    .unwrap_err();
  assert!(node.is_not_found(&err));
  assert_eq!(err.as_not_found(), Some(&sentinel));
  assert_eq!(counter.calls(), 1);

  // 2. The placeholder answers without querying.
  let err = node
    .take::<User, _, _, _>("user:404", counter.returning(None, Duration::ZERO))
    .await
    .unwrap_err();
  assert!(node.is_not_found(&err));
  assert_eq!(counter.calls(), 1);
  assert!(node.is_not_found(&node.get::<User>("user:404").await.unwrap_err()));

  // 3. Once it expires the source is asked again.
  tokio::time::advance(Duration::from_secs(61)).await;
  let user: User = node
    .take("user:404", counter.returning(Some(User::new(404, "late")), Duration::ZERO))
    .await
    .unwrap();
  assert_eq!(user.name, "late");
  assert_eq!(counter.calls(), 2);
}

#[tokio::test]
async fn test_query_returning_the_sentinel_counts_as_missing() {
  let sentinel = NotFound::new("no such user");
  let node = node_with(FlakyStorage::new(), &sentinel);

  let reported = sentinel.clone();
  let err = node
    .take::<User, _, _, _>("user:9", move || async move { Err(reported) })
    .await
    .unwrap_err();
  assert!(node.is_not_found(&err));
  assert_eq!(node.storage().inner().len(), 1, "placeholder written");
}

#[tokio::test]
async fn test_disabled_placeholder_queries_every_time() {
  let node = CacheNode::builder("n", MemoryStorage::new())
    .options(CacheOptions::new().not_found_expiry(Duration::ZERO))
    .build()
    .unwrap();
  let counter = QueryCounter::new();

  for _ in 0..3 {
    let err = node
      .take::<u32, _, _, _>("k", counter.returning(None, Duration::ZERO))
      .await
      .unwrap_err();
    assert!(err.as_not_found().is_some());
  }
  assert_eq!(counter.calls(), 3);
  assert!(node.storage().is_empty());
}

#[tokio::test]
async fn test_query_errors_pass_through_and_are_not_cached() {
  let sentinel = NotFound::new("no such user");
  let node = node_with(FlakyStorage::new(), &sentinel);

  let err = node
    .take::<User, _, _, _>("user:1", || async {
      Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "db timeout"))
    })
    .await
    .unwrap_err();
  assert!(!node.is_not_found(&err));
  let io = err.downcast_load::<std::io::Error>().unwrap();
  assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
  assert_eq!(node.stat().db_fails, 1);
  assert!(node.storage().inner().is_empty());

  // A later take tries again.
  let user: User = node
    .take("user:1", || async { Ok::<_, std::io::Error>(Some(User::new(1, "ada"))) })
    .await
    .unwrap();
  assert_eq!(user.id, 1);
}

#[tokio::test]
async fn test_unavailable_storage_is_not_not_found() {
  let sentinel = NotFound::new("no such user");
  let storage = FlakyStorage::new();
  storage.set_down(true);
  let node = node_with(storage, &sentinel);
  let counter = QueryCounter::new();

  let err = node.get::<User>("user:1").await.unwrap_err();
  assert!(!node.is_not_found(&err));
  assert!(matches!(err, CacheError::Storage(StorageError::Unavailable(_))));

  // The source is not queried while the cache tier is down.
  let err = node
    .take::<User, _, _, _>("user:1", counter.returning(Some(User::new(1, "ada")), Duration::ZERO))
    .await
    .unwrap_err();
  assert!(matches!(err, CacheError::Storage(_)));
  assert_eq!(counter.calls(), 0);

  // Failed lookups count as misses.
  let stat = node.stat();
  assert_eq!((stat.total, stat.hits, stat.misses), (2, 0, 2));
}

#[tokio::test]
async fn test_oversized_expiries_are_stored_without_expiry() {
  let node = CacheNode::builder("n", MemoryStorage::new())
    .options(CacheOptions::new().expiry(Duration::MAX))
    .build()
    .unwrap();

  node.set("jittered", &1u32).await.unwrap();
  node.set_with_expire("exact", &2u32, Duration::MAX).await.unwrap();
  assert_eq!(node.storage().remaining_ttl("jittered"), Some(None));
  assert_eq!(node.storage().remaining_ttl("exact"), Some(None));

  let value: u32 = node
    .take_with_expire("filled", Duration::MAX, |_| async { Ok::<_, std::io::Error>(Some(3u32)) })
    .await
    .unwrap();
  assert_eq!(value, 3);
  assert_eq!(node.get::<u32>("filled").await.unwrap(), 3);
}

#[tokio::test]
async fn test_failed_write_after_load_still_returns_value() {
  let storage = FlakyStorage::new();
  let node = CacheNode::new("n", storage).unwrap();
  let gate_storage = node.storage().clone();

  let user: User = node
    .take("user:1", move || async move {
      // The cache tier fails between the miss and the write-back.
      gate_storage.set_down(true);
      Ok::<_, std::io::Error>(Some(User::new(1, "ada")))
    })
    .await
    .unwrap();
  assert_eq!(user.name, "ada");
  assert!(node.storage().inner().is_empty());
}

#[tokio::test]
async fn test_corrupt_entries_are_dropped() {
  let sentinel = NotFound::new("no such user");
  let node = node_with(FlakyStorage::new(), &sentinel);
  node
    .storage()
    .inner()
    .set("user:1", b"{not json".to_vec(), None)
    .await
    .unwrap();

  let err = node.get::<User>("user:1").await.unwrap_err();
  assert!(node.is_not_found(&err));
  assert!(!node.storage().inner().contains_key("user:1"));
}

#[tokio::test]
async fn test_del_reports_failures_per_key() {
  let storage = FlakyStorage::new();
  storage.fail_key("b");
  let node = CacheNode::new("n", storage).unwrap();
  for key in ["a", "b", "c"] {
    node.set(key, &1u8).await.unwrap();
  }

  assert!(node.del(&[]).await.is_ok());

  let err = node.del(&["a", "b", "c"]).await.unwrap_err();
  let batch = err.as_batch().unwrap();
  assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["b"]);
  assert!(!node.storage().inner().contains_key("a"));
  assert!(node.storage().inner().contains_key("b"));

  // A single key failing as a whole keeps the storage error itself.
  node.storage().set_down(true);
  let err = node.del(&["a"]).await.unwrap_err();
  assert!(matches!(err, CacheError::Storage(StorageError::Unavailable(_))));

  let err = node.del(&["a", "c"]).await.unwrap_err();
  assert_eq!(err.as_batch().unwrap().len(), 2);
}
