//! Retry placement policies.
//!
//! Whether a failed job runs again is decided by its own retry budget
//! (`retry_count <= max_retries`). A [`RetryStrategy`] only decides *where* the job goes
//! back into the pending list, or gives up early.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use notewise_core::Job;

use crate::executor::ExecutorError;

/// Placement of a job that will be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Head of the pending list; runs next.
    RequeueFront,
    /// Normal priority insertion, behind jobs of equal priority.
    RequeueByPriority,
    /// Priority insertion, not dispatched before the delay has elapsed.
    RequeueAfter(Duration),
    /// Fail the job now, even though retries remain.
    GiveUp,
}

pub trait RetryStrategy: Send + Sync + 'static {
    /// Called after `job.retry_count` was incremented and found within budget.
    fn decide(&self, job: &Job, error: &ExecutorError) -> RetryDecision;
}

impl<S: RetryStrategy + ?Sized> RetryStrategy for Arc<S> {
    fn decide(&self, job: &Job, error: &ExecutorError) -> RetryDecision {
        (**self).decide(job, error)
    }
}

/// Retried jobs jump the queue and run again immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateRequeue;

impl RetryStrategy for ImmediateRequeue {
    fn decide(&self, _job: &Job, _error: &ExecutorError) -> RetryDecision {
        RetryDecision::RequeueFront
    }
}

/// Retried jobs wait behind everything of equal or higher urgency.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueByPriority;

impl RetryStrategy for RequeueByPriority {
    fn decide(&self, _job: &Job, _error: &ExecutorError) -> RetryDecision {
        RetryDecision::RequeueByPriority
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` every time.
    Fixed,
    /// `base`, `2 * base`, `4 * base`, ...
    #[default]
    Exponential,
    /// `base`, `2 * base`, `3 * base`, ...
    Linear,
}

/// Delay computation for [`DelayedBackoff`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Relative spread around the nominal delay, `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    pub fn linear(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    /// Delay before retry number `attempt` (1-indexed), never above `max_delay` before
    /// jitter is applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let nominal = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
        .min(self.max_delay);

        let spread = self.jitter.clamp(0.0, 1.0);
        if spread == 0.0 {
            return nominal;
        }
        // Golden-ratio sequence: offsets in [-1, 1) that differ between consecutive attempts.
        let offset = (f64::from(attempt) * 0.618_033_988_749_895).fract() * 2.0 - 1.0;
        Duration::try_from_secs_f64(nominal.as_secs_f64() * (1.0 + spread * offset))
            .unwrap_or(nominal)
    }
}

/// Retried jobs are re-inserted by priority and held back for a computed delay.
#[derive(Debug, Clone, Default)]
pub struct DelayedBackoff {
    policy: BackoffPolicy,
}

impl DelayedBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl RetryStrategy for DelayedBackoff {
    fn decide(&self, job: &Job, _error: &ExecutorError) -> RetryDecision {
        RetryDecision::RequeueAfter(self.policy.delay_for_attempt(job.retry_count))
    }
}

/// Gives up as soon as the budget is exhausted; otherwise defers to `S`.
#[derive(Debug, Clone, Default)]
pub struct FailFastOnBudget<S> {
    inner: S,
}

impl<S: RetryStrategy> FailFastOnBudget<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

impl<S: RetryStrategy> RetryStrategy for FailFastOnBudget<S> {
    fn decide(&self, job: &Job, error: &ExecutorError) -> RetryDecision {
        if error.is_budget_exceeded() {
            RetryDecision::GiveUp
        } else {
            self.inner.decide(job, error)
        }
    }
}
