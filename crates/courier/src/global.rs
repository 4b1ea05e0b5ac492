//! Process-wide dispatcher and free-function entry points
//!
//! Most code should construct its own [`Dispatcher`] and pass it around. The
//! functions here serve callers that want one shared instance for the whole
//! process: call [`init`] once at startup (or let [`dispatcher`] create a
//! default one on first use) and [`shutdown`] before exiting.
//!
//! The dispatcher loop is spawned on the tokio runtime that submits the first
//! task, so the shared instance must only be used from that runtime.

use std::future::Future;
use std::time::Duration;

use once_cell::sync::OnceCell;
use tracing::info;

use crate::batch::Batch;
use crate::dispatcher::Dispatcher;
use crate::error::{BoxError, ConfigError, CourierResult, TaskError};
use crate::handle::DeferredTask;
use crate::task::TaskId;
use crate::types::DispatcherConfig;

static GLOBAL: OnceCell<Dispatcher> = OnceCell::new();

/// Create the process-wide dispatcher with `config`.
///
/// Fails with [`ConfigError::AlreadyInitialized`] if the dispatcher already
/// exists, whether from an earlier `init` or from a call to [`dispatcher`].
pub fn init(config: DispatcherConfig) -> Result<&'static Dispatcher, ConfigError> {
    let dispatcher = Dispatcher::new(config)?;
    GLOBAL
        .set(dispatcher)
        .map_err(|_| ConfigError::AlreadyInitialized)?;
    info!(
        queue_capacity = config.queue_capacity,
        max_running = config.max_running,
        "Initialized process-wide dispatcher"
    );
    Ok(self::dispatcher())
}

/// The process-wide dispatcher, created with default limits on first use
pub fn dispatcher() -> &'static Dispatcher {
    GLOBAL.get_or_init(Dispatcher::default)
}

/// Stop the process-wide dispatcher and wait for admitted work to finish
pub async fn shutdown() {
    if let Some(dispatcher) = GLOBAL.get() {
        dispatcher.shutdown().await;
    }
}

/// See [`Dispatcher::task`]
pub async fn task<A, F, Fut, T, E>(callback: F, args: A) -> CourierResult<TaskId>
where
    A: Send + 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    dispatcher().task(callback, args).await
}

/// See [`Dispatcher::task_with_finish`]
pub async fn task_with_finish<A, F, Fut, T, E, C>(
    callback: F,
    args: A,
    on_finish: C,
) -> CourierResult<TaskId>
where
    A: Send + 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
    C: FnOnce(TaskId, Result<T, TaskError>) + Send + 'static,
{
    dispatcher().task_with_finish(callback, args, on_finish).await
}

/// See [`Dispatcher::task_wait`]
pub async fn task_wait<A, F, Fut, T, E>(
    callback: F,
    args: A,
    timeout: Option<Duration>,
) -> CourierResult<T>
where
    A: Send + 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    dispatcher().task_wait(callback, args, timeout).await
}

/// See [`Dispatcher::task_defer`]
pub async fn task_defer<A, F, Fut, T, E>(callback: F, args: A) -> CourierResult<DeferredTask<T>>
where
    A: Send + 'static,
    F: FnOnce(A) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<BoxError>,
{
    dispatcher().task_defer(callback, args).await
}

/// See [`Dispatcher::multi_task`]
pub fn multi_task<T>(max_concurrent: Option<usize>) -> CourierResult<Batch<T>>
where
    T: Clone + Send + 'static,
{
    dispatcher().multi_task(max_concurrent)
}
