use fibre_fetch::{from_cancelable_fn, CancellationToken, FetchManager};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

#[tokio::main]
async fn main() {
  // A fetch that takes a second, unless its shard shuts down first.
  let fetcher = from_cancelable_fn(|key: &'static str, closed: CancellationToken| async move {
    tokio::select! {
      _ = sleep(Duration::from_secs(1)) => Ok(key.to_uppercase()),
      _ = closed.cancelled() => {
        println!("--- Upstream: fetch for '{}' aborted by shutdown", key);
        Err("aborted".to_string())
      }
    }
  });
  let manager = Arc::new(FetchManager::new(fetcher).expect("Failed to build fetch manager"));

  // One impatient caller and one patient caller share the same fetch.
  let impatient = CancellationToken::new();
  let first = tokio::spawn({
    let manager = manager.clone();
    let impatient = impatient.clone();
    async move { manager.fetch_with_cancel("report", &impatient).await }
  });
  let second = tokio::spawn({
    let manager = manager.clone();
    async move { manager.fetch("report").await }
  });

  sleep(Duration::from_millis(100)).await;
  impatient.cancel();
  println!("Impatient caller: {:?}", first.await.unwrap());
  println!("Patient caller:   {:?}", second.await.unwrap());

  // A caller with a deadline.
  let result = manager.fetch_with_timeout("slow", Duration::from_millis(50)).await;
  println!("Deadline caller:  {:?}", result);

  // Closing aborts the still-running fetch for "slow" and rejects later calls.
  manager.close().unwrap();
  sleep(Duration::from_millis(10)).await;
  println!("After close:      {:?}", manager.fetch("report").await);
}
