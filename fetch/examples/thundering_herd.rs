use fibre_fetch::{from_fn, FetchManagerBuilder};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use tokio::time::{sleep, Duration};

// A simulated database or slow external service.
async fn fetch_from_database(key: i32, calls: Arc<AtomicUsize>) -> Result<String, String> {
  println!("--- Database: request for key {}. Simulating slow query...", key);
  calls.fetch_add(1, Ordering::SeqCst);
  sleep(Duration::from_millis(500)).await;
  Ok(format!("value_for_{}", key))
}

#[tokio::main]
async fn main() {
  let calls = Arc::new(AtomicUsize::new(0));

  let manager = Arc::new(
    FetchManagerBuilder::new()
      .time_to_live(Duration::from_secs(2))
      .cleanup_interval(Duration::from_millis(100))
      .build(from_fn({
        let calls = calls.clone();
        move |key: i32| fetch_from_database(key, calls.clone())
      }))
      .expect("Failed to build fetch manager"),
  );

  println!("--- Thundering Herd Demonstration ---");
  println!("Spawning 10 tasks to request key 42 at once.\n");

  let mut tasks = Vec::new();
  for i in 0..10 {
    let manager = manager.clone();
    tasks.push(tokio::spawn(async move {
      let value = manager.fetch(42).await.unwrap();
      println!("[Task {}] Received value: {}", i, value);
    }));
  }
  for task in tasks {
    task.await.unwrap();
  }
  println!("\nDatabase was called {} time(s).", calls.load(Ordering::SeqCst));

  println!("\n--- After the TTL ---");
  sleep(Duration::from_millis(2200)).await;
  let value = manager.fetch(42).await.unwrap();
  println!("Received value: {}", value);
  println!("Database was called {} time(s) in total.", calls.load(Ordering::SeqCst));

  manager.close().unwrap();
  println!("\nMetrics: {:#?}", manager.metrics());
}
