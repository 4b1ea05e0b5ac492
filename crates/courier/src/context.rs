//! Execution-scoped context visible to a running task callback

use std::future::Future;

use crate::batch::BatchId;
use crate::task::TaskId;

tokio::task_local! {
    static CURRENT: TaskContext;
}

/// Identity of the task whose callback is currently executing.
///
/// The context is only set while the callback's future is being polled by the
/// dispatcher. It is gone on every exit path, including errors and panics, and
/// is not inherited by tasks the callback spawns itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskContext {
    task_id: TaskId,
    batch_id: Option<BatchId>,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, batch_id: Option<BatchId>) -> Self {
        Self { task_id, batch_id }
    }

    /// The context of the callback being executed, if any
    pub fn current() -> Option<TaskContext> {
        CURRENT.try_with(|ctx| *ctx).ok()
    }

    /// Id of the executing task
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Id of the batch the task belongs to, if it is a batch member
    pub fn batch_id(&self) -> Option<BatchId> {
        self.batch_id
    }

    /// Run `future` with this context installed
    pub(crate) async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT.scope(self, future).await
    }
}

/// Id of the task whose callback is currently executing
pub fn current_task_id() -> Option<TaskId> {
    TaskContext::current().map(|ctx| ctx.task_id)
}
