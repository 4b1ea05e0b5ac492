//! Handles for retrieving the outcome of a deferred task

use std::time::Duration;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::debug;

use crate::deadline::Deadline;
use crate::error::{CourierError, CourierResult, TaskError};
use crate::task::TaskId;

/// Receiving side of a task submitted with `task_defer`.
///
/// The task starts running as soon as it is admitted, whether or not anyone
/// calls [`recv`](DeferredTask::recv). A timed-out `recv` can be retried; the
/// outcome stays in the handle until it is taken once.
#[derive(Debug)]
pub struct DeferredTask<T> {
    id: TaskId,
    receiver: Option<oneshot::Receiver<Result<T, TaskError>>>,
}

impl<T> DeferredTask<T> {
    pub(crate) fn new(id: TaskId, receiver: oneshot::Receiver<Result<T, TaskError>>) -> Self {
        Self {
            id,
            receiver: Some(receiver),
        }
    }

    /// Id of the underlying task
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Check if the outcome has already been taken
    pub fn is_consumed(&self) -> bool {
        self.receiver.is_none()
    }

    /// Wait for the task's outcome.
    ///
    /// With a timeout, gives up after that long with
    /// [`CourierError::TaskTimeout`] and leaves the task running. The task's
    /// own failure is returned as [`CourierError::Task`].
    pub async fn recv(&mut self, timeout: Option<Duration>) -> CourierResult<T> {
        let deadline = Deadline::after(timeout);
        let id = self.id;
        let receiver = self.receiver.as_mut().ok_or_else(|| consumed(id))?;

        let received = match deadline.wait(receiver).await {
            Ok(received) => received,
            Err(err) => {
                debug!(task_id = %id, "Gave up waiting for deferred task");
                return Err(err);
            }
        };
        self.receiver = None;
        received.map_err(|_| dropped(id))?.map_err(CourierError::from)
    }

    /// Take the outcome if the task has already finished.
    ///
    /// Returns `Ok(None)` while the task is still pending.
    pub fn try_recv(&mut self) -> CourierResult<Option<T>> {
        let id = self.id;
        let receiver = self.receiver.as_mut().ok_or_else(|| consumed(id))?;
        match receiver.try_recv() {
            Ok(outcome) => {
                self.receiver = None;
                outcome.map(Some).map_err(CourierError::from)
            }
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => {
                self.receiver = None;
                Err(dropped(id))
            }
        }
    }
}

fn consumed(id: TaskId) -> CourierError {
    CourierError::invalid_state(format!("outcome of task {id} was already received"))
}

fn dropped(id: TaskId) -> CourierError {
    CourierError::invalid_state(format!("task {id} was dropped before delivering its outcome"))
}
