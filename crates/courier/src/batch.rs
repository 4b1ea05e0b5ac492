//! Batches of tasks with a shared concurrency cap and two ways to consume
//! their outcomes

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Debug, Display};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::deadline::Deadline;
use crate::dispatcher::Dispatcher;
use crate::error::{BoxError, CourierError, CourierResult, TaskError};
use crate::task::{Completion, TaskId, WorkUnit};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a batch, assigned in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchId(pub u64);

impl BatchId {
    pub(crate) fn next() -> Self {
        Self(NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a batch. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BatchStatus {
    /// Members can still be added
    Preparing,
    /// A consumer is attached and members are still outstanding
    Waiting,
    /// Every outcome has been observed; nothing may be registered anymore
    Done,
}

/// How the outcomes of a batch are being consumed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    WaitAll,
    YieldEach,
}

enum Notifier {
    All(oneshot::Sender<()>),
    Each(mpsc::Sender<TaskId>),
}

struct BatchState<T> {
    status: BatchStatus,
    mode: Option<ConsumeMode>,
    members: HashSet<TaskId>,
    results: IndexMap<TaskId, T>,
    errors: IndexMap<TaskId, TaskError>,
    running: usize,
    backlog: VecDeque<WorkUnit<T>>,
    notifier: Option<Notifier>,
}

impl<T> BatchState<T> {
    fn new() -> Self {
        Self {
            status: BatchStatus::Preparing,
            mode: None,
            members: HashSet::new(),
            results: IndexMap::new(),
            errors: IndexMap::new(),
            running: 0,
            backlog: VecDeque::new(),
            notifier: None,
        }
    }

    /// Members that have not registered an outcome yet
    fn outstanding(&self) -> usize {
        self.members.len() - self.results.len() - self.errors.len()
    }

    fn can_admit(&self, max_concurrent: Option<usize>) -> bool {
        max_concurrent.map_or(true, |max| self.running < max)
    }

    /// Attach a consumer. A batch can be consumed once, by one protocol.
    fn begin(&mut self, mode: ConsumeMode) -> CourierResult<()> {
        if let Some(current) = self.mode {
            return Err(CourierError::invalid_state(format!(
                "batch is already being consumed with {current:?}"
            )));
        }
        self.mode = Some(mode);
        self.status = if self.members.is_empty() {
            BatchStatus::Done
        } else {
            BatchStatus::Waiting
        };
        Ok(())
    }

    fn check_register(&self, id: TaskId) -> CourierResult<()> {
        if self.status == BatchStatus::Done {
            return Err(CourierError::invalid_state(format!(
                "task {id} registered an outcome after the batch was done"
            )));
        }
        if !self.members.contains(&id) {
            return Err(CourierError::invalid_state(format!(
                "task {id} is not a member of this batch"
            )));
        }
        if self.results.contains_key(&id) {
            return Err(CourierError::invalid_state(format!(
                "task {id} already has a result"
            )));
        }
        if self.errors.contains_key(&id) {
            return Err(CourierError::invalid_state(format!(
                "task {id} already has an error"
            )));
        }
        Ok(())
    }

    fn notify(&mut self, id: TaskId) {
        if let Some(Notifier::Each(sender)) = &self.notifier {
            // Sized to the outstanding count when installed, so never full.
            let _ = sender.try_send(id);
            return;
        }
        if self.mode.is_some() && self.outstanding() == 0 {
            self.status = BatchStatus::Done;
            if let Some(Notifier::All(sender)) = self.notifier.take() {
                let _ = sender.send(());
            }
        }
    }

    /// Pop the next backlog member if the cap leaves room for it
    fn refill(&mut self, max_concurrent: Option<usize>) -> Option<WorkUnit<T>> {
        if !self.can_admit(max_concurrent) {
            return None;
        }
        let next = self.backlog.pop_front()?;
        self.running += 1;
        Some(next)
    }
}

/// State shared between a [`Batch`] and its in-flight members
pub(crate) struct BatchShared<T> {
    id: BatchId,
    max_concurrent: Option<usize>,
    dispatcher: Dispatcher,
    state: Mutex<BatchState<T>>,
}

impl<T: Send + 'static> BatchShared<T> {
    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    fn lock(&self) -> MutexGuard<'_, BatchState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a member's outcome and pick the next backlog member to admit.
    ///
    /// Validation, recording, notification and the refill decision all happen
    /// under one lock, so the running count never exceeds the cap.
    pub(crate) fn register(
        &self,
        id: TaskId,
        outcome: Result<T, TaskError>,
    ) -> CourierResult<Option<WorkUnit<T>>> {
        let mut state = self.lock();
        state.check_register(id)?;

        match outcome {
            Ok(value) => {
                state.results.insert(id, value);
            }
            Err(err) => {
                state.errors.insert(id, err);
            }
        }
        state.running = state.running.saturating_sub(1);
        state.notify(id);

        Ok(state.refill(self.max_concurrent))
    }

    /// Called by a member once its callback has finished
    pub(crate) async fn complete(&self, id: TaskId, outcome: Result<T, TaskError>) {
        match self.register(id, outcome) {
            Ok(next) => self.admit(next).await,
            Err(err) => {
                error!(
                    batch_id = %self.id,
                    task_id = %id,
                    error = %err,
                    "Batch member outcome rejected"
                );
            }
        }
    }

    /// Dispatch backlog members until one is accepted or the backlog is empty.
    async fn admit(&self, mut next: Option<WorkUnit<T>>) {
        while let Some(unit) = next.take() {
            let task_id = unit.id();
            debug!(batch_id = %self.id, %task_id, "Admitting backlog member");
            let Err(err) = self.dispatcher.push(Box::new(unit)).await else {
                break;
            };

            // The member never runs, so the dispatch failure is its outcome.
            error!(
                batch_id = %self.id,
                %task_id,
                error = %err,
                "Failed to dispatch backlog member"
            );
            next = match self.register(task_id, Err(TaskError::from(err))) {
                Ok(next) => next,
                Err(err) => {
                    error!(
                        batch_id = %self.id,
                        %task_id,
                        error = %err,
                        "Batch member outcome rejected"
                    );
                    None
                }
            };
        }
    }
}

/// A set of tasks run under an optional concurrency cap.
///
/// Members are added while the batch is [`BatchStatus::Preparing`] and start
/// running right away unless the cap is reached, in which case they wait in a
/// FIFO backlog until a running member finishes. The outcomes are consumed
/// once, either all together with [`wait_for_all`](Batch::wait_for_all) or
/// in completion order with [`yield_each`](Batch::yield_each).
///
/// Failed members never abort the batch. Their errors are looked up per id
/// with [`error`](Batch::error) or [`error_map`](Batch::error_map).
pub struct Batch<T> {
    shared: Arc<BatchShared<T>>,
}

impl<T> Debug for Batch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("id", &self.shared.id)
            .field("max_concurrent", &self.shared.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl<T> Batch<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(dispatcher: Dispatcher, max_concurrent: Option<usize>) -> Self {
        let id = BatchId::next();
        debug!(batch_id = %id, ?max_concurrent, "Created batch");
        Self {
            shared: Arc::new(BatchShared {
                id,
                max_concurrent,
                dispatcher,
                state: Mutex::new(BatchState::new()),
            }),
        }
    }

    pub fn id(&self) -> BatchId {
        self.shared.id
    }

    /// Number of members added so far
    pub fn count(&self) -> usize {
        self.shared.lock().members.len()
    }

    pub fn status(&self) -> BatchStatus {
        self.shared.lock().status
    }

    /// Per-batch concurrency cap, `None` when only the dispatcher limits it
    pub fn max_concurrent(&self) -> Option<usize> {
        self.shared.max_concurrent
    }

    /// Add a member running `callback(args)` and return its id.
    ///
    /// Only valid while the batch is preparing. If the dispatcher refuses the
    /// member, it is removed from the batch again and
    /// [`CourierError::AddTaskFailed`] is returned.
    pub async fn add_task<A, F, Fut, E>(&self, callback: F, args: A) -> CourierResult<TaskId>
    where
        A: Send + 'static,
        F: FnOnce(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let unit = WorkUnit::new(callback, args, Completion::Batch(self.shared.clone()));
        let task_id = unit.id();

        let dispatch_now = {
            let mut state = self.shared.lock();
            if state.status != BatchStatus::Preparing {
                return Err(CourierError::invalid_state(format!(
                    "cannot add tasks to batch {} once it is {:?}",
                    self.shared.id, state.status
                )));
            }
            state.members.insert(task_id);
            if state.can_admit(self.shared.max_concurrent) {
                state.running += 1;
                Some(unit)
            } else {
                debug!(
                    batch_id = %self.shared.id,
                    %task_id,
                    "Batch is saturated, member goes to backlog"
                );
                state.backlog.push_back(unit);
                None
            }
        };

        if let Some(unit) = dispatch_now {
            if let Err(err) = self.shared.dispatcher.push(Box::new(unit)).await {
                let next = {
                    let mut state = self.shared.lock();
                    state.members.remove(&task_id);
                    state.running = state.running.saturating_sub(1);
                    // A consumer may have attached while the push was pending
                    // and now counts one member too many.
                    state.notify(task_id);
                    state.refill(self.shared.max_concurrent)
                };
                self.shared.admit(next).await;
                return Err(err);
            }
        }
        Ok(task_id)
    }

    /// Wait until every member has finished and return the successful values.
    ///
    /// Failed members are absent from the map. With a timeout, the budget is
    /// fixed when this method is called; on expiry a
    /// [`CourierError::TaskTimeout`] is returned and the members keep
    /// running, their outcomes still landing in [`results`](Batch::results)
    /// and [`error_map`](Batch::error_map).
    pub async fn wait_for_all(
        &self,
        timeout: Option<Duration>,
    ) -> CourierResult<IndexMap<TaskId, T>> {
        let deadline = Deadline::after(timeout);
        let receiver = {
            let mut state = self.shared.lock();
            state.begin(ConsumeMode::WaitAll)?;
            if state.outstanding() == 0 {
                state.status = BatchStatus::Done;
                return Ok(state.results.clone());
            }
            let (sender, receiver) = oneshot::channel();
            state.notifier = Some(Notifier::All(sender));
            receiver
        };

        let waited = deadline.wait(receiver).await;

        let mut state = self.shared.lock();
        if state.status == BatchStatus::Done {
            return Ok(state.results.clone());
        }
        state.notifier = None;
        match waited {
            Err(err) => {
                debug!(
                    batch_id = %self.shared.id,
                    outstanding = state.outstanding(),
                    "Stopped waiting for batch"
                );
                Err(err)
            }
            Ok(_) => Err(CourierError::invalid_state(format!(
                "batch {} lost its completion signal",
                self.shared.id
            ))),
        }
    }

    /// Consume the outcomes one by one, in completion order.
    ///
    /// Values that had already arrived are yielded first. Failed members are
    /// skipped. The timeout covers only the time spent waiting inside
    /// [`YieldEach::next`]; time the caller spends between items is not
    /// counted.
    pub fn yield_each(&self, timeout: Option<Duration>) -> CourierResult<YieldEach<T>> {
        let deadline = Deadline::after(timeout);
        let mut state = self.shared.lock();
        state.begin(ConsumeMode::YieldEach)?;

        let ready: VecDeque<(TaskId, T)> = state
            .results
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect();
        let remaining = state.outstanding();
        let receiver = if remaining > 0 {
            let (sender, receiver) = mpsc::channel(remaining);
            state.notifier = Some(Notifier::Each(sender));
            Some(receiver)
        } else {
            None
        };

        Ok(YieldEach {
            shared: self.shared.clone(),
            ready,
            receiver,
            remaining,
            deadline,
            yielded_at: Some(Instant::now()),
            finished: false,
        })
    }

    /// Value of a member that succeeded
    pub fn result(&self, id: TaskId) -> Option<T> {
        self.shared.lock().results.get(&id).cloned()
    }

    /// Snapshot of every successful value registered so far
    pub fn results(&self) -> IndexMap<TaskId, T> {
        self.shared.lock().results.clone()
    }

    /// Error of a member that failed
    pub fn error(&self, id: TaskId) -> Option<TaskError> {
        self.shared.lock().errors.get(&id).cloned()
    }

    /// Snapshot of every error registered so far
    pub fn error_map(&self) -> IndexMap<TaskId, TaskError> {
        self.shared.lock().errors.clone()
    }
}

/// Forward-only sequence of `(id, value)` pairs produced by
/// [`Batch::yield_each`].
pub struct YieldEach<T> {
    shared: Arc<BatchShared<T>>,
    ready: VecDeque<(TaskId, T)>,
    receiver: Option<mpsc::Receiver<TaskId>>,
    remaining: usize,
    deadline: Deadline,
    /// Set while the consumer holds the last item, cleared once `next` runs
    yielded_at: Option<Instant>,
    finished: bool,
}

impl<T> Debug for YieldEach<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("YieldEach")
            .field("batch_id", &self.shared.id)
            .field("ready", &self.ready.len())
            .field("remaining", &self.remaining)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<T> YieldEach<T>
where
    T: Clone + Send + 'static,
{
    /// Next successful outcome, or `None` once every member has been seen.
    ///
    /// After a timeout the sequence is over and further calls return `None`.
    pub async fn next(&mut self) -> CourierResult<Option<(TaskId, T)>> {
        if self.finished {
            return Ok(None);
        }
        // A `next` dropped mid-wait leaves this unset, so its wait stays counted.
        if let Some(yielded_at) = self.yielded_at.take() {
            self.deadline.extend(yielded_at.elapsed());
        }

        if let Some(pair) = self.ready.pop_front() {
            return Ok(Some(self.yield_pair(pair)));
        }

        while self.remaining > 0 {
            let Some(receiver) = self.receiver.as_mut() else {
                break;
            };
            let id = match self.deadline.wait(receiver.recv()).await {
                Ok(Some(id)) => id,
                Ok(None) => break,
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };
            self.remaining -= 1;

            let value = self.shared.lock().results.get(&id).cloned();
            if let Some(value) = value {
                return Ok(Some(self.yield_pair((id, value))));
            }
        }

        self.finish();
        Ok(None)
    }

    /// Turn the sequence into a [`Stream`]
    pub fn into_stream(self) -> impl Stream<Item = CourierResult<(TaskId, T)>> {
        futures::stream::unfold(self, |mut each| async move {
            match each.next().await {
                Ok(Some(pair)) => Some((Ok(pair), each)),
                Ok(None) => None,
                Err(err) => Some((Err(err), each)),
            }
        })
    }

    /// Drain the rest of the sequence and return the batch's full result map
    pub async fn into_results(mut self) -> CourierResult<IndexMap<TaskId, T>> {
        while self.next().await?.is_some() {}
        Ok(self.shared.lock().results.clone())
    }

    fn yield_pair(&mut self, pair: (TaskId, T)) -> (TaskId, T) {
        self.yielded_at = Some(Instant::now());
        pair
    }

    fn finish(&mut self) {
        self.finished = true;
        self.receiver = None;
        let mut state = self.shared.lock();
        state.notifier = None;
        state.status = BatchStatus::Done;
    }

    fn abandon(&mut self) {
        self.finished = true;
        self.receiver = None;
        let mut state = self.shared.lock();
        state.notifier = None;
        debug!(
            batch_id = %self.shared.id,
            outstanding = state.outstanding(),
            "Stopped waiting for batch members"
        );
        if state.outstanding() == 0 {
            state.status = BatchStatus::Done;
        }
    }
}
