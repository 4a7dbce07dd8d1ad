//! Priority request scheduler with admission control, retries and timeouts
//!
//! Every accepted task lives in exactly one place: the ordered queue, the
//! active set, or a retry backoff. All three are fields of one `State`
//! guarded by a single mutex that is never held across an await, so
//! dispatch, completion, timeout and cancellation each observe and mutate a
//! consistent snapshot. Settling a task removes its record; whichever path
//! removes it first delivers the outcome and the others become no-ops.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{AppError, Result};
use crate::queue::rate_limit::{Tier, UserRateLimiter};
use crate::queue::retry::should_retry;

/// Re-invocable unit of work; called once per attempt, from the worker task
pub type Work<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Wrap an async closure as scheduler work
pub fn work<T, F, Fut>(f: F) -> Work<T>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()) as BoxFuture<'static, Result<T>>)
}

/// Queue position report delivered to the caller
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueueStatus {
    Queued {
        /// 1-based position in dispatch order
        position: usize,
        /// Queued plus active tasks
        total_in_system: usize,
        eta_secs: u64,
    },
    Processing,
}

/// Who is asking, and how to report back
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub owner: String,
    pub tier: Tier,
    /// Overrides the tier's default priority
    pub priority: Option<u8>,
    pub status_tx: Option<mpsc::Sender<QueueStatus>>,
}

impl EnqueueOptions {
    pub fn new(owner: impl Into<String>, tier: Tier) -> Self {
        Self {
            owner: owner.into(),
            tier,
            priority: None,
            status_tx: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_status(mut self, status_tx: mpsc::Sender<QueueStatus>) -> Self {
        self.status_tx = Some(status_tx);
        self
    }
}

/// Pending result of an enqueued task
pub struct TaskHandle<T> {
    id: String,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| {
                Err(AppError::Internal("Scheduler dropped the request".to_string()))
            })
        })
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub queued: usize,
    pub active: usize,
    pub backing_off: usize,
    pub max_concurrent: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
    pub avg_task_secs: f64,
}

/// Retried work jumps ahead of fresh work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Lane {
    Retry,
    Fresh,
}

/// Dispatch order: lane, then priority descending, then arrival
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    lane: Lane,
    priority: Reverse<u8>,
    seq: u64,
}

enum Phase {
    Queued(QueueKey),
    Active { worker: AbortHandle, started: Instant },
    Backoff { timer: AbortHandle },
}

struct TaskRecord<T> {
    owner: String,
    priority: u8,
    work: Work<T>,
    attempts: u32,
    enqueued_at: Instant,
    phase: Phase,
    responder: oneshot::Sender<Result<T>>,
    run_timer: Option<AbortHandle>,
    queue_timer: Option<AbortHandle>,
    status_tx: Option<mpsc::Sender<QueueStatus>>,
    status_ticker: Option<AbortHandle>,
}

impl<T> TaskRecord<T> {
    /// Stop every timer and deliver the outcome
    fn settle(self, outcome: Result<T>) {
        for timer in [self.run_timer, self.queue_timer, self.status_ticker]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
        if let Phase::Backoff { timer } = &self.phase {
            timer.abort();
        }
        let _ = self.responder.send(outcome);
    }
}

struct State<T> {
    tasks: HashMap<String, TaskRecord<T>>,
    queue: BTreeMap<QueueKey, String>,
    active: usize,
    peak_active: usize,
    next_seq: u64,
    avg_task_secs: f64,
    completed: u64,
    failed: u64,
}

impl<T> State<T> {
    fn next_key(&mut self, lane: Lane, priority: u8) -> QueueKey {
        self.next_seq += 1;
        QueueKey {
            lane,
            priority: Reverse(priority),
            seq: self.next_seq,
        }
    }

    fn queue_status(&self, key: &QueueKey, max_concurrent: usize) -> QueueStatus {
        let position = self.queue.range(..key).count() + 1;
        let avg = self.avg_task_secs;
        let load = self.active as f64 / max_concurrent.max(1) as f64;
        let eta = position as f64 * avg + load * avg / 2.0;
        QueueStatus::Queued {
            position,
            total_in_system: self.queue.len() + self.active,
            eta_secs: eta.round().max(0.0) as u64,
        }
    }

    fn record_duration(&mut self, elapsed: Duration) {
        self.avg_task_secs = self.avg_task_secs * 0.8 + elapsed.as_secs_f64() * 0.2;
    }
}

#[derive(Debug, Clone, Copy)]
enum Deadline {
    Run,
    Queue,
}

struct Shared<T> {
    config: SchedulerConfig,
    limiter: Arc<UserRateLimiter>,
    state: Mutex<State<T>>,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Admission-controlled priority scheduler
pub struct RequestScheduler<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for RequestScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> RequestScheduler<T> {
    /// Create a scheduler; must be called inside a Tokio runtime
    pub fn new(config: SchedulerConfig) -> Self {
        let limiter = Arc::new(UserRateLimiter::new(&config));
        let sweeper = limiter.spawn_sweeper(config.rate_window().max(Duration::from_secs(1)));
        let state = State {
            tasks: HashMap::new(),
            queue: BTreeMap::new(),
            active: 0,
            peak_active: 0,
            next_seq: 0,
            avg_task_secs: config.avg_task_secs,
            completed: 0,
            failed: 0,
        };

        info!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            retry_attempts = config.retry_attempts,
            "Request scheduler started"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                limiter,
                state: Mutex::new(state),
                sweeper: Some(sweeper),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    pub fn rate_limiter(&self) -> &Arc<UserRateLimiter> {
        &self.shared.limiter
    }

    /// Enqueue and wait for the outcome
    pub async fn schedule(
        &self,
        task_id: impl Into<String>,
        work: Work<T>,
        options: EnqueueOptions,
    ) -> Result<T> {
        self.enqueue(task_id, work, options)?.await
    }

    /// Admit a task and return a handle to its eventual result
    pub fn enqueue(
        &self,
        task_id: impl Into<String>,
        work: Work<T>,
        options: EnqueueOptions,
    ) -> Result<TaskHandle<T>> {
        let id = task_id.into();
        let EnqueueOptions {
            owner,
            tier,
            priority,
            status_tx,
        } = options;

        self.shared.limiter.try_acquire(&owner, tier)?;

        let mut state = self.shared.state.lock();

        if state.tasks.contains_key(&id) {
            drop(state);
            self.shared.limiter.release(&owner);
            return Err(AppError::InvalidRequest(format!("Request id '{}' is already in use", id)));
        }

        let waiting = state.queue.len();
        if waiting >= self.shared.config.max_queue_size {
            drop(state);
            self.shared.limiter.release(&owner);
            warn!(task_id = %id, owner = %owner, waiting, "Request queue is full");
            return Err(AppError::QueueFull(waiting));
        }

        let priority = priority.unwrap_or_else(|| tier.priority());
        let key = state.next_key(Lane::Fresh, priority);
        state.queue.insert(key, id.clone());

        let (responder, rx) = oneshot::channel();
        let run_timer = self.spawn_deadline(&id, Deadline::Run, self.shared.config.request_timeout());
        let queue_timer = self.spawn_deadline(&id, Deadline::Queue, self.shared.config.queue_timeout());
        let status_ticker = status_tx.as_ref().map(|_| self.spawn_status_ticker(&id));

        state.tasks.insert(
            id.clone(),
            TaskRecord {
                owner: owner.clone(),
                priority,
                work,
                attempts: 0,
                enqueued_at: Instant::now(),
                phase: Phase::Queued(key),
                responder,
                run_timer: Some(run_timer),
                queue_timer: Some(queue_timer),
                status_tx,
                status_ticker,
            },
        );

        debug!(
            task_id = %id,
            owner = %owner,
            priority,
            queued = state.queue.len(),
            active = state.active,
            "Request queued"
        );

        self.dispatch(&mut state);
        Ok(TaskHandle { id, rx })
    }

    /// Remove a task that has not started executing.
    ///
    /// Tasks waiting out a retry backoff count as not executing.
    pub fn cancel(&self, task_id: &str, owner: &str) -> Result<()> {
        let mut state = self.shared.state.lock();

        let record = state
            .tasks
            .get(task_id)
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))?;

        if record.owner != owner {
            return Err(AppError::Forbidden(task_id.to_string()));
        }

        let queued_at = match &record.phase {
            Phase::Active { .. } => return Err(AppError::NotCancellable(task_id.to_string())),
            Phase::Queued(key) => Some(*key),
            Phase::Backoff { .. } => None,
        };

        if let Some(key) = queued_at {
            state.queue.remove(&key);
        }
        if let Some(record) = state.tasks.remove(task_id) {
            record.settle(Err(AppError::Cancelled));
        }
        info!(task_id = %task_id, owner = %owner, "Request cancelled");
        Ok(())
    }

    /// Current status of a task, if it is still in the system
    pub fn status(&self, task_id: &str) -> Option<QueueStatus> {
        let state = self.shared.state.lock();
        let record = state.tasks.get(task_id)?;
        Some(match &record.phase {
            Phase::Queued(key) => state.queue_status(key, self.shared.config.max_concurrent),
            Phase::Active { .. } | Phase::Backoff { .. } => QueueStatus::Processing,
        })
    }

    /// Owner of a task still in the system
    pub fn owner_of(&self, task_id: &str) -> Option<String> {
        self.shared.state.lock().tasks.get(task_id).map(|r| r.owner.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.shared.state.lock();
        let backing_off = state
            .tasks
            .values()
            .filter(|r| matches!(r.phase, Phase::Backoff { .. }))
            .count();
        SchedulerStats {
            queued: state.queue.len(),
            active: state.active,
            backing_off,
            max_concurrent: self.shared.config.max_concurrent,
            peak_active: state.peak_active,
            completed: state.completed,
            failed: state.failed,
            avg_task_secs: state.avg_task_secs,
        }
    }

    /// Start queued tasks while there is capacity
    fn dispatch(&self, state: &mut State<T>) {
        let max_concurrent = self.shared.config.max_concurrent;

        while state.active < max_concurrent {
            let Some((_, id)) = state.queue.pop_first() else {
                break;
            };
            let Some(record) = state.tasks.get_mut(&id) else {
                continue;
            };

            if let Some(timer) = record.queue_timer.take() {
                timer.abort();
            }
            if let Some(ticker) = record.status_ticker.take() {
                ticker.abort();
            }
            if let Some(tx) = &record.status_tx {
                let _ = tx.try_send(QueueStatus::Processing);
            }

            record.attempts += 1;
            let attempt = record.attempts;
            let waited = record.enqueued_at.elapsed();
            let work = record.work.clone();
            let scheduler = self.clone();
            let task_id = id.clone();
            // The future is built inside the worker, after the state lock is released
            let worker = tokio::spawn(async move {
                let outcome = AssertUnwindSafe(async move { work().await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        error!(task_id = %task_id, "Request worker panicked");
                        Err(AppError::Internal(format!(
                            "Request worker panicked: {}",
                            panic_message(panic.as_ref())
                        )))
                    });
                scheduler.finish(&task_id, outcome);
            });

            record.phase = Phase::Active {
                worker: worker.abort_handle(),
                started: Instant::now(),
            };
            state.active += 1;
            state.peak_active = state.peak_active.max(state.active);

            debug!(
                task_id = %id,
                attempt,
                waited_ms = waited.as_millis() as u64,
                active = state.active,
                "Request dispatched"
            );
        }
    }

    /// Record the outcome of one attempt
    fn finish(&self, task_id: &str, outcome: Result<T>) {
        let mut state = self.shared.state.lock();

        let started = match state.tasks.get(task_id).map(|r| &r.phase) {
            Some(Phase::Active { started, .. }) => *started,
            // Settled by a deadline while the work was finishing
            _ => return,
        };
        state.active -= 1;
        state.record_duration(started.elapsed());

        match outcome {
            Ok(value) => {
                if let Some(record) = state.tasks.remove(task_id) {
                    debug!(task_id = %task_id, attempts = record.attempts, "Request completed");
                    record.settle(Ok(value));
                }
                state.completed += 1;
            }
            Err(error) => {
                let retry_attempts = self.shared.config.retry_attempts;
                let retry_delay = self.shared.config.retry_delay();
                let attempts = state.tasks.get(task_id).map_or(0, |r| r.attempts);

                if attempts < retry_attempts && should_retry(&error) {
                    let delay = retry_delay * attempts;
                    warn!(
                        task_id = %task_id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Request failed, retrying"
                    );
                    let timer = self.spawn_backoff(task_id, delay);
                    if let Some(record) = state.tasks.get_mut(task_id) {
                        record.phase = Phase::Backoff { timer };
                    }
                } else {
                    if let Some(record) = state.tasks.remove(task_id) {
                        warn!(
                            task_id = %task_id,
                            attempts = record.attempts,
                            error = %error,
                            "Request failed"
                        );
                        record.settle(Err(error));
                    }
                    state.failed += 1;
                }
            }
        }

        self.dispatch(&mut state);
    }

    /// Put a task that finished its backoff back at the front of the queue
    fn requeue(&self, task_id: &str) {
        let mut state = self.shared.state.lock();

        let priority = match state.tasks.get(task_id) {
            Some(record) if matches!(record.phase, Phase::Backoff { .. }) => record.priority,
            _ => return,
        };
        let key = state.next_key(Lane::Retry, priority);
        state.queue.insert(key, task_id.to_string());
        if let Some(record) = state.tasks.get_mut(task_id) {
            record.phase = Phase::Queued(key);
        }

        self.dispatch(&mut state);
    }

    /// A deadline fired; settle the task if it is still subject to it
    fn expire(&self, task_id: &str, deadline: Deadline) {
        let mut state = self.shared.state.lock();

        let Some(record) = state.tasks.get(task_id) else {
            return;
        };

        let error = match (deadline, &record.phase) {
            (Deadline::Queue, Phase::Queued(_)) => {
                AppError::QueueTimeout(self.shared.config.queue_timeout_ms)
            }
            (Deadline::Queue, _) => return,
            (Deadline::Run, _) => AppError::RequestTimeout(self.shared.config.request_timeout_ms),
        };

        let Some(record) = state.tasks.remove(task_id) else {
            return;
        };
        match &record.phase {
            Phase::Queued(key) => {
                state.queue.remove(key);
            }
            Phase::Active { worker, .. } => {
                worker.abort();
                state.active -= 1;
            }
            Phase::Backoff { .. } => {}
        }
        state.failed += 1;

        warn!(task_id = %task_id, owner = %record.owner, error = %error, "Request expired");
        record.settle(Err(error));

        self.dispatch(&mut state);
    }

    fn spawn_deadline(&self, task_id: &str, deadline: Deadline, after: Duration) -> AbortHandle {
        let weak = Arc::downgrade(&self.shared);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.expire(&task_id, deadline);
            }
        })
        .abort_handle()
    }

    fn spawn_backoff(&self, task_id: &str, delay: Duration) -> AbortHandle {
        let weak = Arc::downgrade(&self.shared);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(scheduler) = upgrade(&weak) {
                scheduler.requeue(&task_id);
            }
        })
        .abort_handle()
    }

    fn spawn_status_ticker(&self, task_id: &str) -> AbortHandle {
        let weak = Arc::downgrade(&self.shared);
        let task_id = task_id.to_string();
        let initial_delay = Duration::from_millis(self.shared.config.initial_status_delay_ms);
        let interval = Duration::from_millis(self.shared.config.status_interval_ms.max(1));

        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(scheduler) = upgrade(&weak) else {
                    break;
                };
                let (status, tx) = {
                    let state = scheduler.shared.state.lock();
                    match state.tasks.get(&task_id) {
                        Some(TaskRecord {
                            phase: Phase::Queued(key),
                            status_tx: Some(tx),
                            ..
                        }) => (
                            state.queue_status(key, scheduler.shared.config.max_concurrent),
                            tx.clone(),
                        ),
                        _ => break,
                    }
                };
                if tx.is_closed() {
                    break;
                }
                let _ = tx.try_send(status);
            }
        })
        .abort_handle()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

fn upgrade<T>(weak: &Weak<Shared<T>>) -> Option<RequestScheduler<T>> {
    weak.upgrade().map(|shared| RequestScheduler { shared })
}
