use fibre_cluster::{Cache, CacheOptions, ClusterBuilder, MemoryStorage, NodeConf, NotFound};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use tokio::time::{sleep, Duration};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Product {
  id: u64,
  title: String,
}

// A simulated database with one slow query.
async fn fetch_product(id: u64, queries: Arc<AtomicUsize>) -> Result<Option<Product>, std::io::Error> {
  println!("--- Database: loading product {}...", id);
  queries.fetch_add(1, Ordering::SeqCst);
  sleep(Duration::from_millis(300)).await;
  if id >= 1000 {
    return Ok(None);
  }
  Ok(Some(Product {
    id,
    title: format!("product #{}", id),
  }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let no_such_product = NotFound::new("no such product");
  let conf = vec![
    NodeConf::new("cache-a", ()),
    NodeConf::new("cache-b", ()),
    NodeConf::new("cache-c", ()).with_weight(200),
  ];
  let cluster = Arc::new(
    ClusterBuilder::new(no_such_product.clone())
      .options(CacheOptions::new().expiry(Duration::from_secs(600)))
      .report_interval(Duration::from_secs(60))
      .build(&conf, |_| Ok(MemoryStorage::new()))?,
  );
  let queries = Arc::new(AtomicUsize::new(0));

  println!("--- Thundering Herd Demonstration ---");
  println!("Spawning 10 tasks that all miss on 'product:42' at once.\n");

  let mut tasks = Vec::new();
  for i in 0..10 {
    let (cluster, queries) = (cluster.clone(), queries.clone());
    tasks.push(tokio::spawn(async move {
      let product: Product = cluster
        .take("product:42", move || fetch_product(42, queries))
        .await?;
      println!("[Task {}] Received: {:?}", i, product);
      Ok::<_, fibre_cluster::CacheError>(())
    }));
  }
  for task in tasks {
    task.await??;
  }
  println!("\nDatabase queries for 10 concurrent misses: {}", queries.load(Ordering::SeqCst));

  println!("\n--- Missing Rows ---");
  for _ in 0..2 {
    let queries = queries.clone();
    match cluster
      .take::<Product, _, _, _>("product:4040", move || fetch_product(4040, queries))
      .await
    {
      Err(err) if cluster.is_not_found(&err) => println!("product:4040 -> {}", err),
      other => println!("product:4040 -> unexpected {:?}", other),
    }
  }
  println!("Total database queries: {}", queries.load(Ordering::SeqCst));

  println!("\n--- Routing ---");
  for key in ["product:1", "product:2", "product:3", "product:42"] {
    if let Some(node) = cluster.node_for(key) {
      println!("{} -> {}", key, node.name());
    }
  }

  let stat = cluster.stat();
  println!(
    "\nLookups: {}, hits: {}, misses: {}, hit ratio: {:.1}%",
    stat.total,
    stat.hits,
    stat.misses,
    stat.hit_ratio() * 100.0
  );
  Ok(())
}
