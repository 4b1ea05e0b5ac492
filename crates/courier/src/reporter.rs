//! Execution reporting for dispatched tasks
//!
//! A dispatcher owns one reporter and hands it every lifecycle event of every
//! unit it runs, whatever the unit's completion strategy. This is the place to
//! hook process-wide observers such as progress bars or audit logs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::task::TaskId;

/// Event types that can be reported during task execution
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Task was handed to the pending queue. A push that is refused
    /// afterwards is followed by `Failed`
    Queued { task_id: TaskId },
    /// Task acquired a running slot and its callback started
    Started { task_id: TaskId },
    /// Task callback returned a value
    Completed { task_id: TaskId, duration: Duration },
    /// Task callback returned an error or panicked
    Failed {
        task_id: TaskId,
        error: String,
        duration: Duration,
    },
}

impl TaskEvent {
    /// The task this event is about
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Queued { task_id }
            | TaskEvent::Started { task_id }
            | TaskEvent::Completed { task_id, .. }
            | TaskEvent::Failed { task_id, .. } => *task_id,
        }
    }

    /// Check if this event marks the end of a task
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completed { .. } | TaskEvent::Failed { .. })
    }
}

/// Trait for observing task execution
///
/// Events are reported from the tasks' own execution contexts, so
/// implementations must be cheap and must not block.
pub trait ExecutionReporter: Send + Sync {
    /// Report a task execution event
    fn report_event(&self, event: TaskEvent);
}

/// A no-op reporter that discards all events
#[derive(Debug, Default)]
pub struct NoOpReporter;

impl ExecutionReporter for NoOpReporter {
    fn report_event(&self, _event: TaskEvent) {}
}

/// Reporter that turns every event into a tracing record
#[derive(Debug, Default)]
pub struct TracingReporter {
    context: Option<String>,
}

impl TracingReporter {
    pub fn new() -> Self {
        Self { context: None }
    }

    /// Tag every record with a context string, e.g. the owning service
    pub fn with_context<S: Into<String>>(context: S) -> Self {
        Self {
            context: Some(context.into()),
        }
    }
}

impl ExecutionReporter for TracingReporter {
    fn report_event(&self, event: TaskEvent) {
        let context = self.context.as_deref().unwrap_or_default();
        match event {
            TaskEvent::Queued { task_id } => {
                debug!(context, %task_id, "Task queued");
            }
            TaskEvent::Started { task_id } => {
                debug!(context, %task_id, "Task started");
            }
            TaskEvent::Completed { task_id, duration } => {
                info!(context, %task_id, ?duration, "Task completed");
            }
            TaskEvent::Failed { task_id, error, duration } => {
                warn!(context, %task_id, ?duration, error = %error, "Task failed");
            }
        }
    }
}

/// Reporter backed by a closure
pub struct FnReporter<F> {
    callback: F,
}

impl<F> FnReporter<F>
where
    F: Fn(TaskEvent) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> ExecutionReporter for FnReporter<F>
where
    F: Fn(TaskEvent) + Send + Sync,
{
    fn report_event(&self, event: TaskEvent) {
        (self.callback)(event)
    }
}

/// A multi-reporter that broadcasts events to multiple reporters
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Arc<dyn ExecutionReporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn add_reporter<R: ExecutionReporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Arc::new(reporter));
        self
    }

    pub fn with_reporter(&mut self, reporter: Arc<dyn ExecutionReporter>) {
        self.reporters.push(reporter);
    }
}

impl ExecutionReporter for MultiReporter {
    fn report_event(&self, event: TaskEvent) {
        for reporter in &self.reporters {
            reporter.report_event(event.clone());
        }
    }
}
