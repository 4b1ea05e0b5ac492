//! Courier - Bounded Async Task Dispatcher
//!
//! Hands units of work to tokio tasks through a bounded pending queue and
//! an admission loop that caps how many run at once.
//!
//! # Overview
//!
//! A [`Dispatcher`] accepts callbacks bound to their arguments and runs each
//! on its own tokio task. The outcome is collected in one of four ways:
//! - [`Dispatcher::task`] / [`Dispatcher::task_with_finish`]: fire and forget,
//!   optionally with a finish callback
//! - [`Dispatcher::task_wait`]: wait for the result, with an optional timeout
//! - [`Dispatcher::task_defer`]: get a [`DeferredTask`] handle and receive later
//! - [`Dispatcher::multi_task`]: a [`Batch`] of members under their own
//!   concurrency cap, consumed all at once or one by one as they finish
//!
//! A timeout only ever stops the caller from waiting. Work that has been
//! admitted always runs to completion and delivers its outcome.
//!
//! # Example
//!
//! ```rust
//! use courier::{BoxError, Dispatcher, DispatcherConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::new(DispatcherConfig::default())?;
//!
//!     let sum = dispatcher
//!         .task_wait(|(a, b): (i32, i32)| async move { Ok::<_, BoxError>(a + b) }, (1, 2), None)
//!         .await?;
//!     assert_eq!(sum, 3);
//!
//!     let batch = dispatcher.multi_task::<u64>(Some(2))?;
//!     for n in 1..=4u64 {
//!         batch.add_task(|n: u64| async move { Ok::<_, BoxError>(n * n) }, n).await?;
//!     }
//!     let squares = batch.wait_for_all(Some(Duration::from_secs(1))).await?;
//!     assert_eq!(squares.values().sum::<u64>(), 30);
//!
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod context;
pub mod deadline;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod handle;
pub mod reporter;
pub mod task;
pub mod types;

pub use batch::{Batch, BatchId, BatchStatus, ConsumeMode, YieldEach};
pub use context::{current_task_id, TaskContext};
pub use deadline::Deadline;
pub use dispatcher::Dispatcher;
pub use error::{BoxError, ConfigError, CourierError, CourierResult, TaskError};
pub use handle::DeferredTask;
pub use reporter::{
    ExecutionReporter, FnReporter, MultiReporter, NoOpReporter, TaskEvent, TracingReporter,
};
pub use task::{FinishCallback, TaskId};
pub use types::{DispatcherConfig, DispatcherStats, DEFAULT_MAX_RUNNING, DEFAULT_QUEUE_CAPACITY};

use std::future::Future;
use std::pin::Pin;

/// A boxed future that is Send and can be used across thread boundaries
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
