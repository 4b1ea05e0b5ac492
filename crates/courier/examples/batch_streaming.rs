//! Batch example for the Courier dispatcher
//!
//! This example runs a batch of simulated downloads under a concurrency cap
//! twice: once collecting everything with `wait_for_all`, once streaming each
//! result as soon as it is ready.

use courier::{BoxError, Dispatcher, DispatcherConfig};
use futures::StreamExt;
use std::time::{Duration, Instant};

async fn download(size_kb: u64) -> Result<u64, BoxError> {
    if size_kb == 0 {
        return Err("empty file".into());
    }
    tokio::time::sleep(Duration::from_millis(size_kb)).await;
    Ok(size_kb * 1024)
}

const SIZES: [u64; 8] = [120, 40, 0, 200, 80, 60, 0, 100];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Batch Example ===\n");

    let dispatcher = Dispatcher::new(DispatcherConfig::default())?;

    // Wait for the whole batch
    let batch = dispatcher.multi_task::<u64>(Some(3))?;
    for size in SIZES {
        batch.add_task(download, size).await?;
    }
    println!("Batch {} has {} members", batch.id(), batch.count());

    let start = Instant::now();
    let results = batch.wait_for_all(Some(Duration::from_secs(2))).await?;
    println!("All done in {:?}", start.elapsed());
    for (id, bytes) in &results {
        println!("  task {id}: {bytes} bytes");
    }
    for (id, err) in batch.error_map() {
        println!("  task {id} failed: {err}");
    }

    // Stream results as they complete
    println!("\nStreaming results:");
    let batch = dispatcher.multi_task::<u64>(Some(3))?;
    for size in SIZES {
        batch.add_task(download, size).await?;
    }

    let start = Instant::now();
    let mut stream = Box::pin(batch.yield_each(Some(Duration::from_secs(2)))?.into_stream());
    while let Some(item) = stream.next().await {
        let (id, bytes) = item?;
        println!("  [{:>4?}] task {id}: {bytes} bytes", start.elapsed().as_millis());
    }
    println!("Batch {} is {:?}", batch.id(), batch.status());

    dispatcher.shutdown().await;
    Ok(())
}
