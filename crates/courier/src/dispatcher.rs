//! Bounded task queue and the admission loop that runs queued units

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use once_cell::sync::OnceCell;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::batch::Batch;
use crate::deadline::Deadline;
use crate::error::{BoxError, ConfigError, CourierError, CourierResult, TaskError};
use crate::handle::DeferredTask;
use crate::reporter::{ExecutionReporter, NoOpReporter, TaskEvent};
use crate::task::{Completion, FinishCallback, Runnable, TaskId, WorkUnit};
use crate::types::{DispatcherConfig, DispatcherStats};

type QueuedUnit = Box<dyn Runnable>;

/// One running slot, returned to the dispatcher when dropped
pub(crate) struct RunningSlot(OwnedSemaphorePermit);

impl RunningSlot {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        Self(permit)
    }
}

/// Accepts units of work and runs each one on its own tokio task.
///
/// The pending queue holds at most `queue_capacity` units and at most
/// `max_running` units execute at once. Both limits apply by suspending the
/// caller, never by dropping work. Units are admitted in FIFO order.
///
/// The admission loop is spawned on the ambient tokio runtime the first time
/// a unit is pushed. Cloning a dispatcher yields another handle to the same
/// queue.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: DispatcherConfig,
    sender: Mutex<Option<mpsc::Sender<QueuedUnit>>>,
    receiver: Mutex<Option<mpsc::Receiver<QueuedUnit>>>,
    started: OnceCell<()>,
    run_loop: Mutex<Option<JoinHandle<()>>>,
    closed: Notify,
    slots: Arc<Semaphore>,
    counters: Arc<QueueCounters>,
    reporter: Arc<dyn ExecutionReporter>,
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicUsize,
    dequeued: AtomicUsize,
    blocked: AtomicUsize,
}

/// Keeps the blocked-producer count right even if `push` is cancelled
struct BlockedProducer<'a>(&'a AtomicUsize);

impl<'a> BlockedProducer<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for BlockedProducer<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reports `Queued` up front and `Failed` unless the push goes through
struct QueuedReport<'a> {
    task_id: TaskId,
    reporter: &'a dyn ExecutionReporter,
    accepted: bool,
}

impl<'a> QueuedReport<'a> {
    fn new(task_id: TaskId, reporter: &'a dyn ExecutionReporter) -> Self {
        reporter.report_event(TaskEvent::Queued { task_id });
        Self {
            task_id,
            reporter,
            accepted: false,
        }
    }

    fn accepted(&mut self) {
        self.accepted = true;
    }
}

impl Drop for QueuedReport<'_> {
    fn drop(&mut self) {
        if !self.accepted {
            self.reporter.report_event(TaskEvent::Failed {
                task_id: self.task_id,
                error: CourierError::AddTaskFailed.to_string(),
                duration: Duration::ZERO,
            });
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::build(DispatcherConfig::default(), Arc::new(NoOpReporter))
    }
}

impl Dispatcher {
    /// Create a dispatcher with the given limits
    pub fn new(config: DispatcherConfig) -> Result<Self, ConfigError> {
        Self::with_reporter(config, Arc::new(NoOpReporter))
    }

    /// Create a dispatcher that reports every task event to `reporter`
    pub fn with_reporter(
        config: DispatcherConfig,
        reporter: Arc<dyn ExecutionReporter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, reporter))
    }

    fn build(config: DispatcherConfig, reporter: Arc<dyn ExecutionReporter>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                sender: Mutex::new(Some(sender)),
                receiver: Mutex::new(Some(receiver)),
                started: OnceCell::new(),
                run_loop: Mutex::new(None),
                closed: Notify::new(),
                slots: Arc::new(Semaphore::new(config.max_running)),
                counters: Arc::new(QueueCounters::default()),
                reporter,
            }),
        }
    }

    /// The limits this dispatcher was built with
    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Enqueue a unit, suspending while the pending queue is full.
    ///
    /// Fails with [`CourierError::AddTaskFailed`] once the dispatcher has been
    /// stopped, including for producers that were already waiting for room.
    ///
    /// [`TaskEvent::Queued`] is reported before the unit becomes visible to the
    /// admission loop. If the unit is then refused, or the push is cancelled,
    /// a [`TaskEvent::Failed`] follows for the same id.
    pub(crate) async fn push(&self, unit: QueuedUnit) -> CourierResult<()> {
        let sender = lock(&self.inner.sender)
            .clone()
            .ok_or(CourierError::AddTaskFailed)?;
        self.ensure_started();

        let task_id = unit.id();
        let mut report = QueuedReport::new(task_id, self.inner.reporter.as_ref());
        let unit = match sender.try_send(unit) {
            Ok(()) => None,
            Err(TrySendError::Full(unit)) => Some(unit),
            Err(TrySendError::Closed(_)) => return Err(CourierError::AddTaskFailed),
        };
        if let Some(unit) = unit {
            debug!(%task_id, "Pending queue is full, waiting for room");
            let _blocked = BlockedProducer::enter(&self.inner.counters.blocked);

            let closed = self.inner.closed.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if self.is_closed() {
                return Err(CourierError::AddTaskFailed);
            }

            tokio::select! {
                biased;
                _ = closed => {
                    debug!(%task_id, "Dispatcher stopped while waiting for room");
                    return Err(CourierError::AddTaskFailed);
                }
                sent = sender.send(unit) => sent.map_err(|_| CourierError::AddTaskFailed)?,
            }
        }

        report.accepted();
        self.inner.counters.enqueued.fetch_add(1, Ordering::SeqCst);
        debug!(%task_id, "Task queued");
        Ok(())
    }

    fn ensure_started(&self) {
        self.inner.started.get_or_init(|| {
            if let Some(receiver) = lock(&self.inner.receiver).take() {
                info!(
                    queue_capacity = self.inner.config.queue_capacity,
                    max_running = self.inner.config.max_running,
                    "Starting dispatcher loop"
                );
                let handle = tokio::spawn(run_loop(
                    receiver,
                    self.inner.slots.clone(),
                    self.inner.counters.clone(),
                    self.inner.reporter.clone(),
                ));
                *lock(&self.inner.run_loop) = Some(handle);
            }
        });
    }

    /// Snapshot of queued, blocked and running units. Has no side effects.
    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.inner.counters;
        let dequeued = counters.dequeued.load(Ordering::SeqCst);
        let enqueued = counters.enqueued.load(Ordering::SeqCst);
        DispatcherStats {
            pending: enqueued.saturating_sub(dequeued),
            blocked: counters.blocked.load(Ordering::SeqCst),
            running: self
                .inner
                .config
                .max_running
                .saturating_sub(self.inner.slots.available_permits()),
        }
    }

    /// Check if the pending queue is empty
    pub fn is_empty(&self) -> bool {
        self.stats().pending == 0
    }

    /// Check if the pending queue is at capacity
    pub fn is_full(&self) -> bool {
        self.stats().pending >= self.inner.config.queue_capacity
    }

    /// Check if the dispatcher has been stopped
    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    /// Close the pending queue.
    ///
    /// Units already queued are still run. Every later push fails, and so
    /// does every push still waiting for room.
    pub fn stop(&self) {
        if lock(&self.inner.sender).take().is_some() {
            info!("Dispatcher stopped, draining pending queue");
        }
        self.inner.closed.notify_waiters();
    }

    /// Stop the dispatcher and wait until every admitted unit has finished
    pub async fn shutdown(&self) {
        self.stop();
        let handle = lock(&self.inner.run_loop).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(error = %err, "Dispatcher loop terminated abnormally");
            }
        }
        if let Ok(all) = u32::try_from(self.inner.config.max_running) {
            // Every slot free means every admitted callback has returned.
            let _ = self.inner.slots.acquire_many(all).await;
        }
        debug!("Dispatcher drained");
    }

    /// Run `callback(args)` in the background and return its id immediately.
    ///
    /// A failure is logged as a warning since nobody is waiting for it.
    pub async fn task<A, F, Fut, T, E>(&self, callback: F, args: A) -> CourierResult<TaskId>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError>,
    {
        self.submit(WorkUnit::new(callback, args, Completion::Notify(None)))
            .await
    }

    /// Run `callback(args)` in the background and hand its outcome to
    /// `on_finish` exactly once.
    pub async fn task_with_finish<A, F, Fut, T, E, C>(
        &self,
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
        let on_finish: FinishCallback<T> = Box::new(on_finish);
        self.submit(WorkUnit::new(callback, args, Completion::Notify(Some(on_finish))))
            .await
    }

    /// Run `callback(args)` and wait for its result.
    ///
    /// The budget starts when this method is called, so time spent waiting
    /// for room in the queue counts against it. On timeout the task keeps
    /// running; only this caller stops waiting.
    pub async fn task_wait<A, F, Fut, T, E>(
        &self,
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
        let deadline = Deadline::after(timeout);
        let (sender, receiver) = oneshot::channel();
        let task_id = self
            .submit(WorkUnit::new(callback, args, Completion::Rendezvous(sender)))
            .await?;

        match deadline.wait(receiver).await {
            Ok(Ok(outcome)) => outcome.map_err(CourierError::from),
            Ok(Err(_)) => Err(CourierError::invalid_state(format!(
                "task {task_id} was dropped before delivering its outcome"
            ))),
            Err(err) => {
                debug!(%task_id, "Stopped waiting for task");
                Err(err)
            }
        }
    }

    /// Run `callback(args)` and return a handle to receive its result later
    pub async fn task_defer<A, F, Fut, T, E>(
        &self,
        callback: F,
        args: A,
    ) -> CourierResult<DeferredTask<T>>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<BoxError>,
    {
        let (sender, receiver) = oneshot::channel();
        let task_id = self
            .submit(WorkUnit::new(callback, args, Completion::Rendezvous(sender)))
            .await?;
        Ok(DeferredTask::new(task_id, receiver))
    }

    /// Create a batch whose members run through this dispatcher.
    ///
    /// `max_concurrent` caps how many members of this batch run at once,
    /// independently of the dispatcher's own limit.
    pub fn multi_task<T>(&self, max_concurrent: Option<usize>) -> CourierResult<Batch<T>>
    where
        T: Clone + Send + 'static,
    {
        if let Some(0) = max_concurrent {
            return Err(ConfigError::invalid_max_concurrent(0).into());
        }
        Ok(Batch::new(self.clone(), max_concurrent))
    }

    async fn submit<T: Send + 'static>(&self, unit: WorkUnit<T>) -> CourierResult<TaskId> {
        let task_id = unit.id();
        self.push(Box::new(unit)).await?;
        Ok(task_id)
    }
}

async fn run_loop(
    mut receiver: mpsc::Receiver<QueuedUnit>,
    slots: Arc<Semaphore>,
    counters: Arc<QueueCounters>,
    reporter: Arc<dyn ExecutionReporter>,
) {
    while let Some(unit) = receiver.recv().await {
        counters.dequeued.fetch_add(1, Ordering::SeqCst);

        let permit = match slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let task_id = unit.id();
        debug!(%task_id, "Admitting task");
        tokio::spawn(unit.process(RunningSlot::new(permit), reporter.clone()));
    }
    info!("Dispatcher loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use tokio::time::{sleep, Instant};

    use crate::context::current_task_id;
    use crate::reporter::FnReporter;

    fn dispatcher(queue_capacity: usize, max_running: usize) -> Dispatcher {
        let config = DispatcherConfig::new()
            .with_queue_capacity(queue_capacity)
            .unwrap()
            .with_max_running(max_running)
            .unwrap();
        Dispatcher::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_task_wait_returns_value() {
        let dispatcher = Dispatcher::default();

        let value = dispatcher
            .task_wait(
                |(a, b): (i32, i32)| async move { Ok::<_, BoxError>(a * b) },
                (6, 7),
                None,
            )
            .await
            .unwrap();

        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_task_wait_reraises_task_error() {
        let dispatcher = Dispatcher::default();

        let err = dispatcher
            .task_wait(|_: ()| async { Err::<i32, _>("bad input") }, (), None)
            .await
            .unwrap_err();

        let task_err = err.as_task_error().unwrap();
        assert_eq!(task_err.to_string(), "bad input");
    }

    #[tokio::test]
    async fn test_task_wait_timeout_leaves_task_running() {
        let dispatcher = Dispatcher::default();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let err = dispatcher
            .task_wait(
                move |_: ()| async move {
                    sleep(Duration::from_millis(100)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, BoxError>(())
                },
                (),
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(!finished.load(Ordering::SeqCst));

        sleep(Duration::from_millis(250)).await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finish_callback_receives_outcome() {
        let dispatcher = Dispatcher::default();
        let (done_tx, done_rx) = oneshot::channel();

        let id = dispatcher
            .task_with_finish(
                |_: ()| async {
                    sleep(Duration::from_millis(20)).await;
                    Ok::<_, BoxError>("late")
                },
                (),
                move |id, outcome| {
                    let _ = done_tx.send((id, outcome.ok()));
                },
            )
            .await
            .unwrap();

        let (seen_id, value) = done_rx.await.unwrap();
        assert_eq!(seen_id, id);
        assert_eq!(value, Some("late"));
    }

    #[tokio::test]
    async fn test_finish_notification_fires_exactly_once_per_task() {
        let dispatcher = Dispatcher::new(DispatcherConfig::for_testing()).unwrap();
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let (all_done_tx, mut all_done_rx) = mpsc::channel(32);

        let mut ids = Vec::new();
        for i in 0..20u32 {
            let outcomes = outcomes.clone();
            let all_done = all_done_tx.clone();
            let id = dispatcher
                .task_with_finish(
                    |i: u32| async move {
                        if i % 3 == 0 {
                            Err(format!("task {i} failed"))
                        } else {
                            Ok(i)
                        }
                    },
                    i,
                    move |id, outcome: Result<u32, TaskError>| {
                        outcomes.lock().unwrap().push((id, outcome.is_ok()));
                        let _ = all_done.try_send(());
                    },
                )
                .await
                .unwrap();
            ids.push(id);
        }

        for _ in 0..20 {
            all_done_rx.recv().await.unwrap();
        }

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 20);
        let mut seen: Vec<TaskId> = outcomes.iter().map(|(id, _)| *id).collect();
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
        assert_eq!(outcomes.iter().filter(|(_, ok)| !ok).count(), 7);
    }

    #[tokio::test]
    async fn test_fire_and_forget_failure_does_not_break_the_loop() {
        let dispatcher = dispatcher(4, 1);

        dispatcher
            .task(|_: ()| async { Err::<(), _>("unobserved failure") }, ())
            .await
            .unwrap();
        dispatcher
            .task(
                |fail: bool| async move {
                    if fail {
                        panic!("unobserved panic");
                    }
                    Ok::<_, BoxError>(())
                },
                true,
            )
            .await
            .unwrap();

        let value = dispatcher
            .task_wait(
                |_: ()| async { Ok::<_, BoxError>("still alive") },
                (),
                Some(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        assert_eq!(value, "still alive");
    }

    #[tokio::test]
    async fn test_task_defer_recv() {
        let dispatcher = Dispatcher::default();

        let mut first = dispatcher
            .task_defer(
                |key: &'static str| async move { Ok::<_, BoxError>(format!("get {key}")) },
                "some_key",
            )
            .await
            .unwrap();
        let mut second = dispatcher
            .task_defer(
                |(a, b): (&'static str, &'static str)| async move {
                    Ok::<_, BoxError>(format!("hget {a} {b}"))
                },
                ("a", "b"),
            )
            .await
            .unwrap();
        assert!(second.id() > first.id());

        assert_eq!(second.recv(Some(Duration::from_secs(1))).await.unwrap(), "hget a b");
        assert_eq!(first.recv(None).await.unwrap(), "get some_key");
    }

    #[tokio::test]
    async fn test_task_defer_timeout_does_not_stop_the_task() {
        let dispatcher = Dispatcher::default();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        let mut handle = dispatcher
            .task_defer(
                move |_: ()| async move {
                    sleep(Duration::from_millis(200)).await;
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, BoxError>(7)
                },
                (),
            )
            .await
            .unwrap();

        let err = handle.recv(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(err.is_timeout());

        sleep(Duration::from_millis(400)).await;
        assert!(finished.load(Ordering::SeqCst));

        // The outcome sits in the channel until someone takes it.
        assert_eq!(handle.recv(Some(Duration::from_millis(10))).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_current_task_id_visible_to_callback() {
        let dispatcher = Dispatcher::default();
        let mut handle = dispatcher
            .task_defer(|_: ()| async { Ok::<_, BoxError>(current_task_id()) }, ())
            .await
            .unwrap();

        let seen = handle.recv(None).await.unwrap();
        assert_eq!(seen, Some(handle.id()));
        assert_eq!(current_task_id(), None);
    }

    #[tokio::test]
    async fn test_full_queue_suspends_producer() {
        let dispatcher = dispatcher(1, 1);
        let sleeper = |_: ()| async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(())
        };

        // First unit runs, second waits for a slot inside the loop, third
        // fills the queue. The fourth has to wait for the first to finish.
        let start = Instant::now();
        for _ in 0..3 {
            dispatcher.task(sleeper, ()).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(80));

        let start = Instant::now();
        dispatcher.task(sleeper, ()).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn test_blocked_producer_is_counted() {
        let dispatcher = dispatcher(1, 1);
        let sleeper = |_: ()| async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(())
        };
        for _ in 0..3 {
            dispatcher.task(sleeper, ()).await.unwrap();
        }

        let background = dispatcher.clone();
        let blocked = tokio::spawn(async move { background.task(sleeper, ()).await });
        sleep(Duration::from_millis(30)).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.blocked, 1);
        assert_eq!(stats.running, 1);
        assert!(dispatcher.is_full());

        blocked.await.unwrap().unwrap();
        dispatcher.shutdown().await;
        assert!(dispatcher.stats().is_idle());
    }

    #[tokio::test]
    async fn test_stop_fails_producer_waiting_for_room() {
        let dispatcher = dispatcher(1, 1);
        let sleeper = |_: ()| async {
            sleep(Duration::from_millis(100)).await;
            Ok::<_, BoxError>(())
        };
        for _ in 0..3 {
            dispatcher.task(sleeper, ()).await.unwrap();
        }

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let background = dispatcher.clone();
        let blocked = tokio::spawn(async move {
            background
                .task(
                    move |_: ()| async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok::<_, BoxError>(())
                    },
                    (),
                )
                .await
        });
        sleep(Duration::from_millis(30)).await;
        assert_eq!(dispatcher.stats().blocked, 1);

        dispatcher.stop();
        let err = tokio::time::timeout(Duration::from_millis(50), blocked)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.is_add_task_failed());
        assert_eq!(dispatcher.stats().blocked, 0);

        dispatcher.shutdown().await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(dispatcher.stats().is_idle());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_running_never_exceeds_max_running() {
        let dispatcher = dispatcher(64, 3);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..12 {
            let running = running.clone();
            let peak = peak.clone();
            dispatcher
                .task(
                    move |_: ()| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(20)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(())
                    },
                    (),
                )
                .await
                .unwrap();
        }

        dispatcher.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_units_are_admitted_in_fifo_order() {
        let dispatcher = dispatcher(16, 1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..8 {
            let order = order.clone();
            dispatcher
                .task(
                    move |i: usize| async move {
                        order.lock().unwrap().push(i);
                        Ok::<_, BoxError>(())
                    },
                    i,
                )
                .await
                .unwrap();
        }
        dispatcher.shutdown().await;

        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_stop_rejects_new_tasks_and_drains_queue() {
        let dispatcher = dispatcher(8, 1);
        let completed = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let completed = completed.clone();
            dispatcher
                .task(
                    move |_: ()| async move {
                        sleep(Duration::from_millis(10)).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, BoxError>(())
                    },
                    (),
                )
                .await
                .unwrap();
        }

        dispatcher.stop();
        assert!(dispatcher.is_closed());

        let err = dispatcher
            .task(|_: ()| async { Ok::<_, BoxError>(()) }, ())
            .await
            .unwrap_err();
        assert!(err.is_add_task_failed());

        let err = dispatcher
            .task_wait(|_: ()| async { Ok::<_, BoxError>(()) }, (), None)
            .await
            .unwrap_err();
        assert!(err.is_add_task_failed());

        dispatcher.shutdown().await;
        assert_eq!(completed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_reporter_sees_lifecycle() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = FnReporter::new(move |event: TaskEvent| sink.lock().unwrap().push(event));
        let dispatcher =
            Dispatcher::with_reporter(DispatcherConfig::for_testing(), Arc::new(reporter)).unwrap();

        let ok = dispatcher
            .task_defer(|_: ()| async { Ok::<_, BoxError>(1) }, ())
            .await
            .unwrap();
        let failed = dispatcher
            .task_defer(|_: ()| async { Err::<i32, _>("nope") }, ())
            .await
            .unwrap();
        dispatcher.shutdown().await;

        let events = events.lock().unwrap();
        let for_task = |id: TaskId| {
            events
                .iter()
                .filter(|e| e.task_id() == id)
                .cloned()
                .collect::<Vec<_>>()
        };

        let ok_events = for_task(ok.id());
        assert!(matches!(
            ok_events.as_slice(),
            [
                TaskEvent::Queued { .. },
                TaskEvent::Started { .. },
                TaskEvent::Completed { .. }
            ]
        ));

        let failed_events = for_task(failed.id());
        assert!(matches!(
            failed_events.as_slice(),
            [
                TaskEvent::Queued { .. },
                TaskEvent::Started { .. },
                TaskEvent::Failed { error, .. }
            ] if error == "nope"
        ));
    }

    #[tokio::test]
    async fn test_refused_push_reports_failure_after_queued() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let reporter = FnReporter::new(move |event: TaskEvent| sink.lock().unwrap().push(event));
        let config = DispatcherConfig::new()
            .with_queue_capacity(1)
            .unwrap()
            .with_max_running(1)
            .unwrap();
        let dispatcher = Dispatcher::with_reporter(config, Arc::new(reporter)).unwrap();
        let sleeper = |_: ()| async {
            sleep(Duration::from_millis(50)).await;
            Ok::<_, BoxError>(())
        };
        for _ in 0..3 {
            dispatcher.task(sleeper, ()).await.unwrap();
        }

        let background = dispatcher.clone();
        let blocked = tokio::spawn(async move { background.task(sleeper, ()).await });
        sleep(Duration::from_millis(20)).await;
        dispatcher.stop();
        assert!(blocked.await.unwrap().unwrap_err().is_add_task_failed());
        dispatcher.shutdown().await;

        let events = events.lock().unwrap();
        let refused = events
            .iter()
            .find_map(|e| match e {
                TaskEvent::Failed { task_id, error, .. }
                    if *error == CourierError::AddTaskFailed.to_string() =>
                {
                    Some(*task_id)
                }
                _ => None,
            })
            .unwrap();
        let refused_events: Vec<_> = events.iter().filter(|e| e.task_id() == refused).collect();
        assert!(matches!(
            refused_events.as_slice(),
            [TaskEvent::Queued { .. }, TaskEvent::Failed { duration, .. }] if duration.is_zero()
        ));

        // Every accepted task is seen as queued before it starts.
        let completed: Vec<TaskId> = events
            .iter()
            .filter(|e| matches!(e, TaskEvent::Completed { .. }))
            .map(TaskEvent::task_id)
            .collect();
        assert_eq!(completed.len(), 3);
        for id in completed {
            let first = events.iter().find(|e| e.task_id() == id);
            assert_eq!(first, Some(&TaskEvent::Queued { task_id: id }));
        }
    }

    /// A unit whose id can be read only once
    struct OneShotId {
        id: TaskId,
        reads: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Runnable for OneShotId {
        fn id(&self) -> TaskId {
            if self.reads.fetch_add(1, Ordering::SeqCst) > 0 {
                panic!("task id read twice");
            }
            self.id
        }

        async fn process(
            self: Box<Self>,
            _slot: RunningSlot,
            _reporter: Arc<dyn ExecutionReporter>,
        ) {
        }
    }

    #[tokio::test]
    async fn test_shutdown_survives_a_crashed_loop() {
        let dispatcher = dispatcher(4, 1);
        let unit = OneShotId {
            id: TaskId::next(),
            reads: AtomicUsize::new(0),
        };
        dispatcher.push(Box::new(unit)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), dispatcher.shutdown())
            .await
            .unwrap();
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.stats().running, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = DispatcherConfig { queue_capacity: 0, max_running: 1 };
        assert!(matches!(
            Dispatcher::new(config),
            Err(ConfigError::InvalidQueueCapacity { value: 0 })
        ));
    }

    #[test]
    fn test_zero_batch_limit_is_rejected() {
        let dispatcher = Dispatcher::default();
        assert!(matches!(
            dispatcher.multi_task::<i32>(Some(0)),
            Err(CourierError::Config(ConfigError::InvalidMaxConcurrent { value: 0 }))
        ));
        assert!(dispatcher.multi_task::<i32>(None).is_ok());
    }
}
