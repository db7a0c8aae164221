//! Priority scheduler with a single running slot.
//!
//! ## Dispatch
//!
//! Every state change (enqueue, finish, cancel, clear, resume, a delayed job becoming
//! due) ends in `dispatch`, which starts the first ready pending job if nothing is running
//! and the queue is not paused. The executor runs on a Tokio task; its result comes back
//! through `finish`, which applies the retry state machine and dispatches again.
//!
//! ## Locking
//!
//! All bookkeeping happens under one mutex. Events are appended to an outbox while it is
//! held and published after it is released, so event handlers may call back into the
//! scheduler. One caller at a time drains the outbox; events recorded while it drains
//! (by handlers or other threads) are published by that caller, in recording order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use notewise_core::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, Job, JobId};
use notewise_events::{Event, EventBus};

use crate::executor::{ExecutorError, FnExecutor, JobExecutor, ProgressReporter, ProgressSink};
use crate::retry::{ImmediateRequeue, RetryDecision, RetryStrategy};

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_priority: i32,
    pub default_max_retries: u32,
    /// How many finished jobs stay visible through [`Scheduler::get`].
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: DEFAULT_PRIORITY,
            default_max_retries: DEFAULT_MAX_RETRIES,
            history_limit: 100,
        }
    }
}

/// Per-job overrides for [`Scheduler::enqueue_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<u32>,
}

impl EnqueueOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
}

/// Read-only snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub running_job: Option<Job>,
    pub paused: bool,
    pub stats: SchedulerStats,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Ordered by priority, FIFO within a priority (retries excepted).
    pending: Vec<Job>,
    running: Option<Job>,
    paused: bool,
    history: VecDeque<Job>,
    stats: SchedulerStats,
    /// Due time of the armed wake-up timer, if any.
    wake_at: Option<DateTime<Utc>>,
    /// Events recorded but not yet published.
    outbox: VecDeque<Event>,
    /// Someone is draining the outbox.
    flushing: bool,
}

impl QueueState {
    fn insert_by_priority(&mut self, job: Job) {
        let at = self
            .pending
            .iter()
            .position(|p| p.priority > job.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(at, job);
    }

    fn remember(&mut self, job: Job, limit: usize) {
        if limit == 0 {
            return;
        }
        while self.history.len() >= limit {
            self.history.pop_front();
        }
        self.history.push_back(job);
    }

    fn is_idle(&self) -> bool {
        self.running.is_none() && self.pending.is_empty()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    executors: RwLock<HashMap<String, Arc<dyn JobExecutor>>>,
    retry: Arc<dyn RetryStrategy>,
    bus: EventBus,
    config: SchedulerConfig,
    runtime: Option<Handle>,
    idle: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish outboxed events unless another caller is already doing so.
    fn flush(&self) {
        {
            let mut state = self.state();
            if state.flushing {
                return;
            }
            state.flushing = true;
        }
        loop {
            let event = {
                let mut state = self.state();
                match state.outbox.pop_front() {
                    Some(event) => event,
                    None => {
                        state.flushing = false;
                        return;
                    }
                }
            };
            self.bus.publish(event);
        }
    }
}

/// What `dispatch` decided while holding the lock.
enum Step {
    /// Nothing to start.
    Idle,
    /// A job without executor was failed; look for the next one.
    Skipped,
    Start(Job, Arc<dyn JobExecutor>, Handle),
}

/// Priority job scheduler. Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct Scheduler {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Scheduler with [`ImmediateRequeue`] retries.
    ///
    /// Executors run on the Tokio runtime current at construction, or failing that, the
    /// one current when a job is dispatched.
    pub fn new(bus: EventBus, config: SchedulerConfig) -> Self {
        Self::with_retry_strategy(bus, config, Arc::new(ImmediateRequeue))
    }

    pub fn with_retry_strategy(
        bus: EventBus,
        config: SchedulerConfig,
        retry: Arc<dyn RetryStrategy>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                executors: RwLock::new(HashMap::new()),
                retry,
                bus,
                config,
                runtime: Handle::try_current().ok(),
                idle: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Register the executor for `job_type`, replacing any earlier one.
    pub fn register_executor(&self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) {
        let job_type = job_type.into();
        let replaced = self
            .shared
            .executors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type.clone(), executor);
        if replaced.is_some() {
            warn!(job_type = %job_type, "executor replaced");
        } else {
            debug!(job_type = %job_type, "executor registered");
        }
    }

    /// Register an async closure as the executor for `job_type`.
    pub fn register_fn<F, Fut>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JsonValue, ProgressReporter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<JsonValue, ExecutorError>> + Send + 'static,
    {
        self.register_executor(job_type, Arc::new(FnExecutor::new(f)));
    }

    pub fn has_executor(&self, job_type: &str) -> bool {
        self.shared
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(job_type)
    }

    /// Enqueue with the configured default priority and retry budget.
    pub fn enqueue(&self, job_type: impl Into<String>, data: JsonValue, priority: Option<i32>) -> Job {
        self.enqueue_with(
            job_type,
            data,
            EnqueueOptions {
                priority,
                max_retries: None,
            },
        )
    }

    pub fn enqueue_with(
        &self,
        job_type: impl Into<String>,
        data: JsonValue,
        options: EnqueueOptions,
    ) -> Job {
        let config = &self.shared.config;
        let job = Job::new(
            job_type,
            data,
            options.priority.unwrap_or(config.default_priority),
        )
        .with_max_retries(options.max_retries.unwrap_or(config.default_max_retries));

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            max_retries = job.max_retries,
            "job enqueued"
        );

        {
            let mut state = self.shared.state();
            // Recorded before the job becomes dispatchable so `job:created` always precedes
            // `job:started`.
            state.outbox.push_back(Event::JobCreated { job: job.clone() });
            state.stats.enqueued += 1;
            state.insert_by_priority(job.clone());
        }

        self.dispatch();
        job
    }

    /// Cancel a pending job. Running, finished and unknown ids are left alone.
    pub fn cancel(&self, job_id: JobId) -> bool {
        {
            let mut state = self.shared.state();
            let Some(idx) = state.pending.iter().position(|j| j.id == job_id) else {
                return false;
            };
            let mut job = state.pending.remove(idx);
            job.mark_cancelled();
            state.stats.cancelled += 1;
            state.remember(job.clone(), self.shared.config.history_limit);
            info!(job_id = %job_id, job_type = %job.job_type, "job cancelled");
            state.outbox.push_back(Event::JobCancelled { job });
        }

        self.dispatch();
        true
    }

    /// Cancel every pending job; the running job is not affected.
    pub fn clear(&self) -> usize {
        let count = {
            let mut state = self.shared.state();
            let drained: Vec<Job> = state.pending.drain(..).collect();
            let limit = self.shared.config.history_limit;
            let count = drained.len();
            for mut job in drained {
                job.mark_cancelled();
                state.stats.cancelled += 1;
                state.remember(job.clone(), limit);
                state.outbox.push_back(Event::JobCancelled { job });
            }
            count
        };

        info!(cancelled = count, "pending jobs cleared");
        self.dispatch();
        count
    }

    pub fn pause(&self) {
        {
            let mut state = self.shared.state();
            state.paused = true;
            state.outbox.push_back(Event::QueuePaused);
        }
        info!("queue paused");
        self.shared.flush();
    }

    pub fn resume(&self) {
        {
            let mut state = self.shared.state();
            state.paused = false;
            state.outbox.push_back(Event::QueueResumed);
        }
        info!("queue resumed");
        self.dispatch();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state().paused
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state();
        QueueStatus {
            pending: state.pending.len(),
            running: usize::from(state.running.is_some()),
            running_job: state.running.clone(),
            paused: state.paused,
            stats: state.stats.clone(),
        }
    }

    /// Snapshot of a pending, running or recently finished job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        let state = self.shared.state();
        state
            .running
            .iter()
            .chain(state.pending.iter())
            .chain(state.history.iter().rev())
            .find(|j| j.id == job_id)
            .cloned()
    }

    /// Pending jobs in dispatch order.
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.shared.state().pending.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.state().is_idle()
    }

    /// Resolve once nothing is running and nothing is pending.
    ///
    /// Never resolves while the queue is paused with pending jobs.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn dispatch(&self) {
        loop {
            let step = self.next_step();
            self.shared.flush();

            match step {
                Step::Skipped => continue,
                Step::Idle => {
                    self.shared.idle.notify_waiters();
                    return;
                }
                Step::Start(job, executor, runtime) => {
                    self.spawn_execution(job, executor, runtime);
                    self.shared.idle.notify_waiters();
                    return;
                }
            }
        }
    }

    fn next_step(&self) -> Step {
        let mut state = self.shared.state();
        if state.paused || state.running.is_some() {
            return Step::Idle;
        }

        let now = Utc::now();
        let Some(idx) = state.pending.iter().position(|j| j.is_ready(now)) else {
            if state.pending.is_empty() {
                debug!("queue empty");
                state.outbox.push_back(Event::QueueEmpty);
            } else {
                self.arm_wake_up(&mut state);
            }
            return Step::Idle;
        };

        let mut job = state.pending.remove(idx);
        let executor = self
            .shared
            .executors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job.job_type)
            .cloned();
        let runtime = self
            .shared
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok());

        let failure = match (&executor, &runtime) {
            (None, _) => Some(format!("No executor registered for job type: {}", job.job_type)),
            (Some(_), None) => Some("No async runtime available to run the executor".to_string()),
            _ => None,
        };

        match (failure, executor, runtime) {
            (None, Some(executor), Some(runtime)) => {
                job.mark_running();
                state.running = Some(job.clone());
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.retry_count + 1,
                    "job started"
                );
                state.outbox.push_back(Event::JobStarted { job: job.clone() });
                Step::Start(job, executor, runtime)
            }
            (failure, _, _) => {
                let message = failure.unwrap_or_default();
                error!(job_id = %job.id, job_type = %job.job_type, error = %message, "job failed");
                job.mark_failed(message);
                state.stats.failed += 1;
                state.remember(job.clone(), self.shared.config.history_limit);
                state.outbox.push_back(Event::JobFailed { job });
                Step::Skipped
            }
        }
    }

    /// Make sure a dispatch runs when the earliest delayed job becomes due.
    fn arm_wake_up(&self, state: &mut QueueState) {
        let Some(due) = state.pending.iter().filter_map(|j| j.scheduled_at).min() else {
            return;
        };
        if state.wake_at.is_some_and(|armed| armed <= due) {
            return;
        }
        let Some(runtime) = self
            .shared
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
        else {
            warn!("delayed job cannot be woken without an async runtime");
            return;
        };

        state.wake_at = Some(due);
        let delay = (due - Utc::now()).to_std().unwrap_or_default();
        let shared = Arc::downgrade(&self.shared);
        debug!(delay_ms = delay.as_millis() as u64, "wake-up armed");

        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            {
                let mut state = shared.state();
                if state.wake_at == Some(due) {
                    state.wake_at = None;
                }
            }
            Scheduler { shared }.dispatch();
        });
    }

    fn spawn_execution(&self, job: Job, executor: Arc<dyn JobExecutor>, runtime: Handle) {
        let progress = ProgressReporter::new(Arc::new(RunningJobProgress {
            job_id: job.id,
            shared: Arc::downgrade(&self.shared),
        }));
        let scheduler = self.clone();
        let job_id = job.id;
        let data = job.data;

        let inner_runtime = runtime.clone();
        runtime.spawn(async move {
            // Runs in its own task so a panic surfaces as a JoinError.
            let attempt = inner_runtime.spawn(async move { executor.execute(data, progress).await });
            let outcome = match attempt.await {
                Ok(outcome) => outcome,
                Err(join_err) if join_err.is_panic() => {
                    Err(ExecutorError::Panicked(panic_message(join_err.into_panic())))
                }
                Err(join_err) => Err(ExecutorError::Panicked(join_err.to_string())),
            };
            scheduler.finish(job_id, outcome);
        });
    }

    /// Apply the outcome of the running job, then dispatch the next one.
    fn finish(&self, job_id: JobId, outcome: Result<JsonValue, ExecutorError>) {
        {
            let mut state = self.shared.state();
            let Some(mut job) = state.running.take_if(|j| j.id == job_id) else {
                warn!(job_id = %job_id, "finished job is not the running job");
                return;
            };
            let limit = self.shared.config.history_limit;

            match outcome {
                Ok(result) => {
                    job.mark_completed(result);
                    state.stats.completed += 1;
                    info!(job_id = %job.id, job_type = %job.job_type, "job completed");
                    state.remember(job.clone(), limit);
                    state.outbox.push_back(Event::JobCompleted { job });
                }
                Err(err) => {
                    let message = err.to_string();
                    let decision = if !err.is_retryable() {
                        RetryDecision::GiveUp
                    } else if job.record_failure() {
                        self.shared.retry.decide(&job, &err)
                    } else {
                        RetryDecision::GiveUp
                    };

                    let placed = match decision {
                        RetryDecision::RequeueFront => {
                            job.requeue(None);
                            state.pending.insert(0, job.clone());
                            true
                        }
                        RetryDecision::RequeueByPriority => {
                            job.requeue(None);
                            state.insert_by_priority(job.clone());
                            true
                        }
                        RetryDecision::RequeueAfter(delay) => {
                            let due = Utc::now()
                                + chrono::Duration::from_std(delay).unwrap_or_default();
                            job.requeue(Some(due));
                            state.insert_by_priority(job.clone());
                            true
                        }
                        RetryDecision::GiveUp => false,
                    };

                    if placed {
                        state.stats.retried += 1;
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            retry_count = job.retry_count,
                            max_retries = job.max_retries,
                            decision = ?decision,
                            error = %message,
                            "job failed; retrying"
                        );
                    } else {
                        job.mark_failed(message);
                        state.stats.failed += 1;
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            retry_count = job.retry_count,
                            budget_exceeded = err.is_budget_exceeded(),
                            error = ?job.error,
                            "job failed"
                        );
                        state.remember(job.clone(), limit);
                        state.outbox.push_back(Event::JobFailed { job });
                    }
                }
            }
        }

        self.dispatch();
    }
}

/// Routes progress reports of one execution to the running job.
struct RunningJobProgress {
    job_id: JobId,
    shared: Weak<Shared>,
}

impl ProgressSink for RunningJobProgress {
    fn report(&self, progress: u8, message: Option<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut state = shared.state();
            let effective = match state.running.as_mut() {
                Some(job) if job.id == self.job_id => job.advance_progress(progress),
                _ => return,
            };
            debug!(job_id = %self.job_id, progress = effective, "job progress");
            state.outbox.push_back(Event::JobProgress {
                job_id: self.job_id,
                progress: effective,
                message,
            });
        }
        shared.flush();
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{BackoffPolicy, DelayedBackoff, FailFastOnBudget, RequeueByPriority};
    use notewise_core::JobStatus;
    use notewise_cost::BudgetExceeded;
    use notewise_events::{EventKind, Subscription};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;

    fn scheduler() -> (Scheduler, EventBus) {
        let bus = EventBus::new();
        (Scheduler::new(bus.clone(), SchedulerConfig::default()), bus)
    }

    /// Register an executor that records `data["n"]` in execution order.
    fn recording(scheduler: &Scheduler, job_type: &str) -> Arc<Mutex<Vec<i64>>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        scheduler.register_fn(job_type, move |data, _progress| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(data["n"].as_i64().unwrap_or(-1));
                Ok::<_, ExecutorError>(json!(null))
            }
        });
        order
    }

    fn kinds_for(events: &[Event], job_id: JobId) -> Vec<EventKind> {
        events
            .iter()
            .filter(|e| e.job_id() == Some(job_id))
            .map(Event::kind)
            .collect()
    }

    fn drain(sub: &Subscription<Event>) -> Vec<Event> {
        sub.drain()
    }

    #[tokio::test]
    async fn dispatches_by_priority_then_insertion_order() {
        let (scheduler, _bus) = scheduler();
        let order = recording(&scheduler, "work");

        scheduler.pause();
        for (n, priority) in [5, 1, 5, 3].into_iter().enumerate() {
            scheduler.enqueue("work", json!({ "n": n }), Some(priority));
        }
        scheduler.resume();
        scheduler.wait_until_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![1, 3, 0, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_two_jobs_at_once() {
        let (scheduler, _bus) = scheduler();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let (a, p, r) = (active.clone(), peak.clone(), runs.clone());
        scheduler.register_fn("slow", move |_data, _progress| {
            let (active, peak, runs) = (a.clone(), p.clone(), r.clone());
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ExecutorError>(json!(null))
            }
        });

        let enqueuers: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    for _ in 0..3 {
                        scheduler.enqueue("slow", json!({}), None);
                    }
                })
            })
            .collect();
        for handle in enqueuers {
            handle.await.unwrap();
        }
        scheduler.wait_until_idle().await;

        assert_eq!(runs.load(Ordering::SeqCst), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status().stats.completed, 12);
    }

    #[tokio::test]
    async fn retries_until_budget_is_exhausted() {
        let (scheduler, bus) = scheduler();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        scheduler.register_fn("flaky", move |_data, _progress| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<JsonValue, _>(ExecutorError::transient(format!("boom {n}"))) }
        });
        let sub = bus.stream();

        let job = scheduler.enqueue_with("flaky", json!({}), EnqueueOptions::default().with_max_retries(2));
        scheduler.wait_until_idle().await;

        let finished = scheduler.get(job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.retry_count, 3);
        assert_eq!(finished.error.as_deref(), Some("boom 3"));
        assert!(finished.completed_at.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        assert_eq!(
            kinds_for(&drain(&sub), job.id),
            vec![
                EventKind::JobCreated,
                EventKind::JobStarted,
                EventKind::JobStarted,
                EventKind::JobStarted,
                EventKind::JobFailed,
            ]
        );
        let stats = scheduler.status().stats;
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (scheduler, _bus) = scheduler();
        scheduler.register_fn("bad", |_data, _progress| async {
            Err::<JsonValue, _>(ExecutorError::permanent("content is required"))
        });

        let job = scheduler.enqueue("bad", json!({}), None);
        scheduler.wait_until_idle().await;

        let finished = scheduler.get(job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.retry_count, 0);
        assert_eq!(finished.error.as_deref(), Some("content is required"));
    }

    #[tokio::test]
    async fn budget_errors_are_retried_by_default() {
        let (scheduler, _bus) = scheduler();
        scheduler.register_fn("spend", |_data, _progress| async {
            Err::<JsonValue, _>(ExecutorError::from(BudgetExceeded {
                current_spend: 1.0,
                limit: 1.0,
            }))
        });

        let job = scheduler.enqueue_with("spend", json!({}), EnqueueOptions::default().with_max_retries(1));
        scheduler.wait_until_idle().await;

        let finished = scheduler.get(job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.retry_count, 2);
        assert!(finished.error.unwrap().contains("budget exceeded"));
    }

    #[tokio::test]
    async fn fail_fast_strategy_stops_on_budget_errors() {
        let bus = EventBus::new();
        let scheduler = Scheduler::with_retry_strategy(
            bus,
            SchedulerConfig::default(),
            Arc::new(FailFastOnBudget::new(ImmediateRequeue)),
        );
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        scheduler.register_fn("spend", move |_data, _progress| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<JsonValue, _>(ExecutorError::from(BudgetExceeded {
                    current_spend: 3.0,
                    limit: 2.0,
                }))
            }
        });

        let job = scheduler.enqueue("spend", json!({}), None);
        scheduler.wait_until_idle().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let finished = scheduler.get(job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.retry_count, 1);
    }

    /// Executor that fails the first time it sees `n == 0`.
    fn fails_first_zero(scheduler: &Scheduler) -> Arc<Mutex<Vec<i64>>> {
        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let failed_once = Arc::new(AtomicUsize::new(0));
        scheduler.register_fn("work", move |data, _progress| {
            let seen = seen.clone();
            let failed_once = failed_once.clone();
            async move {
                let n = data["n"].as_i64().unwrap_or(-1);
                seen.lock().unwrap().push(n);
                if n == 0 && failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(ExecutorError::transient("first attempt fails"));
                }
                Ok(json!(n))
            }
        });
        order
    }

    #[tokio::test]
    async fn retried_job_goes_to_the_front() {
        let (scheduler, _bus) = scheduler();
        let order = fails_first_zero(&scheduler);

        scheduler.pause();
        for n in 0..3 {
            scheduler.enqueue("work", json!({ "n": n }), None);
        }
        scheduler.resume();
        scheduler.wait_until_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 0, 1, 2]);
    }

    #[tokio::test]
    async fn requeue_by_priority_waits_behind_equal_priority() {
        let bus = EventBus::new();
        let scheduler = Scheduler::with_retry_strategy(
            bus,
            SchedulerConfig::default(),
            Arc::new(RequeueByPriority),
        );
        let order = fails_first_zero(&scheduler);

        scheduler.pause();
        for n in 0..3 {
            scheduler.enqueue("work", json!({ "n": n }), None);
        }
        scheduler.resume();
        scheduler.wait_until_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 0]);
    }

    #[tokio::test]
    async fn delayed_backoff_holds_the_job_back() {
        let bus = EventBus::new();
        let scheduler = Scheduler::with_retry_strategy(
            bus,
            SchedulerConfig::default(),
            Arc::new(DelayedBackoff::new(BackoffPolicy::fixed(Duration::from_millis(40)))),
        );
        let order = fails_first_zero(&scheduler);

        let started = tokio::time::Instant::now();
        let job = scheduler.enqueue("work", json!({ "n": 0 }), None);

        tokio::task::yield_now().await;
        let waiting = scheduler.get(job.id).unwrap();
        if waiting.status == JobStatus::Pending {
            assert!(waiting.scheduled_at.is_some());
        }

        scheduler.wait_until_idle().await;

        assert!(started.elapsed() >= Duration::from_millis(35));
        assert_eq!(*order.lock().unwrap(), vec![0, 0]);
        let finished = scheduler.get(job.id).unwrap();
        assert_eq!(finished.status, JobStatus::Completed);
        assert_eq!(finished.retry_count, 1);
        assert_eq!(finished.scheduled_at, None);
    }

    #[tokio::test]
    async fn delayed_job_does_not_block_ready_jobs() {
        let bus = EventBus::new();
        let scheduler = Scheduler::with_retry_strategy(
            bus,
            SchedulerConfig::default(),
            Arc::new(DelayedBackoff::new(BackoffPolicy::fixed(Duration::from_millis(30)))),
        );
        let order = fails_first_zero(&scheduler);

        scheduler.pause();
        scheduler.enqueue("work", json!({ "n": 0 }), None);
        scheduler.enqueue("work", json!({ "n": 1 }), None);
        scheduler.resume();
        scheduler.wait_until_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn successful_job_emits_events_in_order() {
        let (scheduler, bus) = scheduler();
        scheduler.register_fn("analyze", |_data, progress| async move {
            progress.report(10);
            progress.report_with(50, "halfway");
            progress.report(30);
            Ok::<_, ExecutorError>(json!({ "ok": true }))
        });
        let sub = bus.stream();

        let job = scheduler.enqueue("analyze", json!({}), None);
        scheduler.wait_until_idle().await;

        let events = drain(&sub);
        assert_eq!(
            kinds_for(&events, job.id),
            vec![
                EventKind::JobCreated,
                EventKind::JobStarted,
                EventKind::JobProgress,
                EventKind::JobProgress,
                EventKind::JobProgress,
                EventKind::JobCompleted,
            ]
        );

        let progress: Vec<(u8, Option<String>)> = events
            .iter()
            .filter_map(|e| match e {
                Event::JobProgress { progress, message, .. } => Some((*progress, message.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(
            progress,
            vec![(10, None), (50, Some("halfway".into())), (50, None)]
        );
        assert_eq!(events.last().map(Event::kind), Some(EventKind::QueueEmpty));

        let done = scheduler.get(job.id).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({ "ok": true })));
    }

    #[tokio::test]
    async fn missing_executor_fails_without_starting() {
        let (scheduler, bus) = scheduler();
        let order = recording(&scheduler, "known");
        let sub = bus.stream();

        scheduler.pause();
        let orphan = scheduler.enqueue("unknown", json!({}), Some(1));
        scheduler.enqueue("known", json!({ "n": 7 }), Some(2));
        scheduler.resume();
        scheduler.wait_until_idle().await;

        let failed = scheduler.get(orphan.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
        assert!(failed.error.unwrap().contains("No executor registered"));
        assert_eq!(
            kinds_for(&drain(&sub), orphan.id),
            vec![EventKind::JobCreated, EventKind::JobFailed]
        );
        assert_eq!(*order.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn panicking_executor_is_a_failure() {
        let (scheduler, _bus) = scheduler();
        scheduler.register_fn("explode", |_data, _progress| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, ExecutorError>(json!(null))
        });
        let order = recording(&scheduler, "after");

        let job = scheduler.enqueue_with("explode", json!({}), EnqueueOptions::default().with_max_retries(0));
        scheduler.enqueue("after", json!({ "n": 1 }), None);
        scheduler.wait_until_idle().await;

        let failed = scheduler.get(job.id).unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.error.unwrap().contains("kaboom"));
        assert_eq!(*order.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn cancel_only_affects_pending_jobs() {
        let (scheduler, bus) = scheduler();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (s, r) = (started.clone(), release.clone());
        scheduler.register_fn("block", move |_data, _progress| {
            let (started, release) = (s.clone(), r.clone());
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<_, ExecutorError>(json!(null))
            }
        });
        let _ = recording(&scheduler, "work");
        let sub = bus.stream();

        let running = scheduler.enqueue("block", json!({}), None);
        started.notified().await;
        let waiting = scheduler.enqueue("work", json!({ "n": 1 }), None);

        assert!(!scheduler.cancel(running.id));
        assert!(scheduler.cancel(waiting.id));
        assert!(!scheduler.cancel(waiting.id));
        assert!(!scheduler.cancel(JobId::new()));
        assert_eq!(scheduler.get(waiting.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(scheduler.get(running.id).unwrap().status, JobStatus::Running);

        release.notify_one();
        scheduler.wait_until_idle().await;
        assert!(!scheduler.cancel(running.id));
        assert_eq!(scheduler.get(running.id).unwrap().status, JobStatus::Completed);

        let events = drain(&sub);
        assert_eq!(
            kinds_for(&events, waiting.id),
            vec![EventKind::JobCreated, EventKind::JobCancelled]
        );
        assert_eq!(scheduler.status().stats.cancelled, 1);
    }

    #[tokio::test]
    async fn clear_cancels_pending_but_not_running() {
        let (scheduler, bus) = scheduler();
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let (s, r) = (started.clone(), release.clone());
        scheduler.register_fn("block", move |_data, _progress| {
            let (started, release) = (s.clone(), r.clone());
            async move {
                started.notify_one();
                release.notified().await;
                Ok::<_, ExecutorError>(json!(null))
            }
        });

        let running = scheduler.enqueue("block", json!({}), None);
        started.notified().await;
        for _ in 0..3 {
            scheduler.enqueue("block", json!({}), None);
        }
        let sub = bus.stream();

        assert_eq!(scheduler.clear(), 3);
        assert!(scheduler.pending_jobs().is_empty());
        assert_eq!(scheduler.status().running, 1);

        let cancelled = drain(&sub)
            .iter()
            .filter(|e| e.kind() == EventKind::JobCancelled)
            .count();
        assert_eq!(cancelled, 3);

        release.notify_one();
        scheduler.wait_until_idle().await;
        assert_eq!(scheduler.get(running.id).unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_dispatch() {
        let (scheduler, bus) = scheduler();
        let order = recording(&scheduler, "work");
        let sub = bus.stream();

        scheduler.pause();
        scheduler.enqueue("work", json!({ "n": 1 }), None);
        tokio::task::yield_now().await;

        let status = scheduler.status();
        assert!(status.paused);
        assert_eq!(status.pending, 1);
        assert_eq!(status.running, 0);
        assert!(order.lock().unwrap().is_empty());

        scheduler.resume();
        scheduler.wait_until_idle().await;
        assert_eq!(*order.lock().unwrap(), vec![1]);

        let kinds: Vec<_> = drain(&sub).iter().map(Event::kind).collect();
        assert_eq!(kinds.first(), Some(&EventKind::QueuePaused));
        assert!(kinds.contains(&EventKind::QueueResumed));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let bus = EventBus::new();
        let scheduler = Scheduler::new(
            bus,
            SchedulerConfig {
                history_limit: 2,
                ..SchedulerConfig::default()
            },
        );
        let _ = recording(&scheduler, "work");

        let jobs: Vec<_> = (0..3)
            .map(|n| scheduler.enqueue("work", json!({ "n": n }), None))
            .collect();
        scheduler.wait_until_idle().await;

        assert!(scheduler.get(jobs[0].id).is_none());
        assert!(scheduler.get(jobs[1].id).is_some());
        assert!(scheduler.get(jobs[2].id).is_some());
    }

    #[tokio::test]
    async fn event_handlers_may_call_back_into_the_scheduler() {
        let (scheduler, bus) = scheduler();
        let order = recording(&scheduler, "work");

        let inner = scheduler.clone();
        bus.subscribe_once(EventKind::JobCompleted, move |_| {
            inner.enqueue("work", json!({ "n": 2 }), None);
        });

        scheduler.enqueue("work", json!({ "n": 1 }), None);
        scheduler.wait_until_idle().await;

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn stream_sees_completion_before_the_job_a_handler_enqueues() {
        let (scheduler, bus) = scheduler();
        let _ = recording(&scheduler, "work");
        let sub = bus.stream();

        let inner = scheduler.clone();
        bus.subscribe_once(EventKind::JobCompleted, move |_| {
            inner.enqueue("work", json!({ "n": 2 }), None);
        });

        let first = scheduler.enqueue("work", json!({ "n": 1 }), None);
        scheduler.wait_until_idle().await;

        let events = drain(&sub);
        let completed = events
            .iter()
            .position(|e| e.kind() == EventKind::JobCompleted && e.job_id() == Some(first.id))
            .unwrap();
        let second: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.job_id().is_some_and(|id| id != first.id))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(second.len(), 3, "created, started, completed");
        assert!(second.iter().all(|&i| i > completed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn lifecycle_events_of_different_jobs_never_interleave() {
        let (scheduler, bus) = scheduler();
        let sub = bus.stream();
        scheduler.register_fn("quick", |_data, progress: ProgressReporter| async move {
            progress.report(50);
            tokio::task::yield_now().await;
            Ok::<_, ExecutorError>(json!(null))
        });

        let enqueuers: Vec<_> = (0..4)
            .map(|_| {
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    for _ in 0..5 {
                        scheduler.enqueue("quick", json!({}), None);
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for handle in enqueuers {
            handle.await.unwrap();
        }
        scheduler.wait_until_idle().await;

        // started, progress* and completed of one job must not be split by another job's
        let mut current: Option<JobId> = None;
        let mut completed = 0;
        while completed < 20 {
            let event = sub.recv_timeout(Duration::from_secs(2)).unwrap();
            match event.kind() {
                EventKind::JobStarted => {
                    assert_eq!(current, None);
                    current = event.job_id();
                }
                EventKind::JobProgress => assert_eq!(event.job_id(), current),
                EventKind::JobCompleted => {
                    assert_eq!(event.job_id(), current);
                    current = None;
                    completed += 1;
                }
                _ => {}
            }
        }
    }

    #[test]
    fn defaults_apply_when_options_are_omitted() {
        let bus = EventBus::new();
        let scheduler = Scheduler::new(
            bus,
            SchedulerConfig {
                default_priority: 7,
                default_max_retries: 1,
                ..SchedulerConfig::default()
            },
        );
        scheduler.pause();

        let job = scheduler.enqueue("work", json!({}), None);
        assert_eq!(job.priority, 7);
        assert_eq!(job.max_retries, 1);

        let job = scheduler.enqueue_with("work", json!({}), EnqueueOptions::priority(2).with_max_retries(9));
        assert_eq!(job.priority, 2);
        assert_eq!(job.max_retries, 9);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: the pending list is a stable sort of the enqueue order by priority.
        #[test]
        fn pending_order_is_stable_priority_sort(priorities in prop::collection::vec(-3i32..6, 0..24)) {
            let scheduler = Scheduler::new(EventBus::new(), SchedulerConfig::default());
            scheduler.pause();

            let ids: Vec<(i32, JobId)> = priorities
                .iter()
                .map(|p| (*p, scheduler.enqueue("work", json!({}), Some(*p)).id))
                .collect();

            let mut expected = ids.clone();
            expected.sort_by_key(|(p, _)| *p);

            let actual: Vec<(i32, JobId)> = scheduler
                .pending_jobs()
                .into_iter()
                .map(|j| (j.priority, j.id))
                .collect();
            prop_assert_eq!(actual, expected);
        }
    }
}
