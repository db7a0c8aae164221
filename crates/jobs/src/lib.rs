//! `notewise-jobs`
//!
//! **Responsibility:** running LLM work one job at a time.
//!
//! - [`Scheduler`] keeps pending jobs ordered by priority (lower first, FIFO within a
//!   priority) and runs at most one of them.
//! - Failed attempts go through a bounded retry state machine; where a retried job lands
//!   is chosen by a [`RetryStrategy`].
//! - Executors are registered per job type and report progress through a
//!   [`ProgressReporter`].
//!
//! Lifecycle changes are published on the [`notewise_events::EventBus`]. Nothing is
//! persisted.

pub mod executor;
pub mod retry;
pub mod scheduler;

pub use executor::{ExecutorError, FnExecutor, JobExecutor, ProgressReporter, ProgressSink};
pub use retry::{
    BackoffPolicy, BackoffStrategy, DelayedBackoff, FailFastOnBudget, ImmediateRequeue,
    RequeueByPriority, RetryDecision, RetryStrategy,
};
pub use scheduler::{EnqueueOptions, QueueStatus, Scheduler, SchedulerConfig, SchedulerStats};
