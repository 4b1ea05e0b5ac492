//! Work units and the strategies that deliver their outcomes

use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::batch::{BatchId, BatchShared};
use crate::context::TaskContext;
use crate::dispatcher::RunningSlot;
use crate::error::{BoxError, TaskError};
use crate::reporter::{ExecutionReporter, TaskEvent};
use crate::BoxFuture;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback invoked once with the outcome of a fire-and-forget task
pub type FinishCallback<T> = Box<dyn FnOnce(TaskId, Result<T, TaskError>) + Send + 'static>;

type TaskBody<T> = Box<dyn FnOnce() -> BoxFuture<Result<T, TaskError>> + Send + 'static>;

/// Where the outcome of a unit goes once its callback has finished
pub(crate) enum Completion<T> {
    /// Hand the outcome to an optional finish callback
    Notify(Option<FinishCallback<T>>),
    /// Push the outcome into a one-shot channel someone receives from
    Rendezvous(oneshot::Sender<Result<T, TaskError>>),
    /// Register the outcome with the owning batch
    Batch(Arc<BatchShared<T>>),
}

impl<T: Send + 'static> Completion<T> {
    fn batch_id(&self) -> Option<BatchId> {
        match self {
            Completion::Batch(batch) => Some(batch.id()),
            _ => None,
        }
    }

    async fn deliver(self, id: TaskId, outcome: Result<T, TaskError>) {
        match self {
            Completion::Notify(Some(on_finish)) => {
                let delivered =
                    std::panic::catch_unwind(AssertUnwindSafe(move || on_finish(id, outcome)));
                if let Err(payload) = delivered {
                    let err = TaskError::from_panic(payload);
                    warn!(task_id = %id, error = %err, "Finish callback panicked");
                }
            }
            Completion::Notify(None) => {
                if let Err(err) = outcome {
                    warn!(
                        task_id = %id,
                        error = %err,
                        "Task failed but no finish callback was supplied"
                    );
                }
            }
            Completion::Rendezvous(sender) => {
                // A waiter that gave up has dropped its receiver.
                if sender.send(outcome).is_err() {
                    debug!(task_id = %id, "Outcome left unobserved, receiver is gone");
                }
            }
            Completion::Batch(batch) => batch.complete(id, outcome).await,
        }
    }
}

/// One schedulable piece of work: a callback bound to its arguments plus the
/// strategy that delivers the outcome.
pub(crate) struct WorkUnit<T> {
    id: TaskId,
    body: TaskBody<T>,
    completion: Completion<T>,
}

impl<T: Send + 'static> WorkUnit<T> {
    pub(crate) fn new<A, F, Fut, E>(callback: F, args: A, completion: Completion<T>) -> Self
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let body: TaskBody<T> =
            Box::new(move || async move { callback(args).await.map_err(TaskError::new) }.boxed());
        Self {
            id: TaskId::next(),
            body,
            completion,
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    /// Invoke the callback with the task context installed, absorbing errors
    /// and panics into the returned outcome.
    async fn call(
        id: TaskId,
        batch_id: Option<BatchId>,
        body: TaskBody<T>,
    ) -> Result<T, TaskError> {
        let context = TaskContext::new(id, batch_id);
        match context.scope(AssertUnwindSafe(body()).catch_unwind()).await {
            Ok(outcome) => outcome,
            Err(payload) => Err(TaskError::from_panic(payload)),
        }
    }
}

/// A unit the dispatcher loop can run without knowing its output type
#[async_trait]
pub(crate) trait Runnable: Send {
    fn id(&self) -> TaskId;

    /// Run the unit to completion, returning `slot` before the outcome is
    /// delivered.
    async fn process(self: Box<Self>, slot: RunningSlot, reporter: Arc<dyn ExecutionReporter>);
}

#[async_trait]
impl<T: Send + 'static> Runnable for WorkUnit<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    async fn process(self: Box<Self>, slot: RunningSlot, reporter: Arc<dyn ExecutionReporter>) {
        let WorkUnit { id, body, completion } = *self;
        let batch_id = completion.batch_id();

        reporter.report_event(TaskEvent::Started { task_id: id });
        let started_at = Instant::now();

        let outcome = Self::call(id, batch_id, body).await;

        let duration = started_at.elapsed();
        match &outcome {
            Ok(_) => {
                debug!(task_id = %id, ?duration, "Task completed");
                reporter.report_event(TaskEvent::Completed { task_id: id, duration });
            }
            Err(err) => {
                debug!(task_id = %id, ?duration, error = %err, "Task failed");
                reporter.report_event(TaskEvent::Failed {
                    task_id: id,
                    error: err.to_string(),
                    duration,
                });
            }
        }

        // Free the slot first: a batch refill may need it.
        drop(slot);
        completion.deliver(id, outcome).await;
    }
}
