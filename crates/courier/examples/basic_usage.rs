//! Basic usage example for the Courier dispatcher
//!
//! This example submits tasks in each of the single-task styles: fire and
//! forget with a finish callback, wait for the result, and defer the result
//! to a handle received later.

use courier::{BoxError, Dispatcher, DispatcherConfig, TracingReporter};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum MathOp {
    Add { a: i32, b: i32 },
    Divide { a: i32, b: i32 },
}

async fn compute(op: MathOp) -> Result<i32, String> {
    // Simulate some work
    tokio::time::sleep(Duration::from_millis(100)).await;
    match op {
        MathOp::Add { a, b } => Ok(a + b),
        MathOp::Divide { a, b } => a
            .checked_div(b)
            .ok_or_else(|| format!("cannot divide {a} by {b}")),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    println!("=== Basic Courier Usage Example ===\n");

    let config = DispatcherConfig::new()
        .with_queue_capacity(64)?
        .with_max_running(8)?;
    let reporter = Arc::new(TracingReporter::with_context("basic_usage"));
    let dispatcher = Dispatcher::with_reporter(config, reporter)?;

    // Fire and forget, observing the outcome through a callback
    let id = dispatcher
        .task_with_finish(compute, MathOp::Divide { a: 1, b: 0 }, |id, outcome| match outcome {
            Ok(value) => println!("  task {id} finished with {value}"),
            Err(err) => println!("  task {id} failed: {err}"),
        })
        .await?;
    println!("Submitted task {id} in the background");

    // Wait for the result
    let sum = dispatcher
        .task_wait(compute, MathOp::Add { a: 10, b: 20 }, Some(Duration::from_secs(1)))
        .await?;
    println!("add(10, 20) = {sum}");

    // Waiting less than the task needs only stops the waiting
    match dispatcher
        .task_wait(compute, MathOp::Add { a: 1, b: 1 }, Some(Duration::from_millis(10)))
        .await
    {
        Ok(value) => println!("unexpectedly fast: {value}"),
        Err(err) => println!("gave up waiting: {err}"),
    }

    // Defer the result and pick it up later
    let mut deferred = dispatcher
        .task_defer(|(a, b): (i32, i32)| async move { Ok::<_, BoxError>(a * b) }, (3, 7))
        .await?;
    println!("Deferred task {} submitted", deferred.id());
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("multiply(3, 7) = {}", deferred.recv(None).await?);

    let stats = dispatcher.stats();
    println!("\nBefore shutdown: {stats:?}");

    dispatcher.shutdown().await;
    println!("After shutdown: {:?}", dispatcher.stats());

    Ok(())
}
