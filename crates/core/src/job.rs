//! Job data model and lifecycle transitions.
//!
//! A [`Job`] is only ever mutated by the scheduler; these methods encode the allowed
//! transitions so the scheduler itself stays a thin state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::id::JobId;

/// Priority given to jobs enqueued without one. Lower numbers run first.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Retry budget given to jobs enqueued without one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in the pending list
    Pending,
    /// Occupying the single running slot
    Running,
    /// Finished successfully
    Completed,
    /// Exhausted retries or failed permanently
    Failed,
    /// Removed before it was dispatched
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routing key for the executor registry (e.g. "content-analysis").
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    /// 0..=100, never decreases while running.
    pub progress: u8,
    pub data: JsonValue,
    pub result: Option<JsonValue>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Lower = more urgent.
    pub priority: i32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Earliest time the job may be dispatched (set by delayed retries only).
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job with the default retry budget.
    pub fn new(job_type: impl Into<String>, data: JsonValue, priority: i32) -> Self {
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            progress: 0,
            data,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            priority,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            scheduled_at: None,
        }
    }

    /// Set a custom retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Check if the job may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.scheduled_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Mark job as running.
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
        self.scheduled_at = None;
    }

    /// Advance progress, clamped to 100 and never moving backwards.
    ///
    /// Returns the effective progress after the update.
    pub fn advance_progress(&mut self, progress: u8) -> u8 {
        self.progress = self.progress.max(progress.min(100));
        self.progress
    }

    /// Mark job as completed.
    pub fn mark_completed(&mut self, result: JsonValue) {
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.progress = 100;
        self.completed_at = Some(Utc::now());
    }

    /// Count a failed attempt. Returns whether the retry budget allows another run.
    pub fn record_failure(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count <= self.max_retries
    }

    /// Put the job back into the pending state for another attempt.
    ///
    /// Progress starts over; the next run reports from zero again.
    pub fn requeue(&mut self, not_before: Option<DateTime<Utc>>) {
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.scheduled_at = not_before;
    }

    /// Mark job as failed (terminal).
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    /// Mark job as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }
}
