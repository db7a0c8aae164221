use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use notewise_core::{Job, JobId};

/// Discriminant of an [`Event`], used as the subscription key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
    QueueEmpty,
    QueuePaused,
    QueueResumed,
    CostUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::JobCreated,
        EventKind::JobStarted,
        EventKind::JobProgress,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobCancelled,
        EventKind::QueueEmpty,
        EventKind::QueuePaused,
        EventKind::QueueResumed,
        EventKind::CostUpdated,
    ];

    /// Stable event name (e.g. "job:created").
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobCreated => "job:created",
            EventKind::JobStarted => "job:started",
            EventKind::JobProgress => "job:progress",
            EventKind::JobCompleted => "job:completed",
            EventKind::JobFailed => "job:failed",
            EventKind::JobCancelled => "job:cancelled",
            EventKind::QueueEmpty => "queue:empty",
            EventKind::QueuePaused => "queue:paused",
            EventKind::QueueResumed => "queue:resumed",
            EventKind::CostUpdated => "cost:updated",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every observable state change in the system.
///
/// Events are facts: they carry a snapshot of the state at the moment they were
/// published and are never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    JobCreated {
        job: Job,
    },
    JobStarted {
        job: Job,
    },
    JobProgress {
        job_id: JobId,
        progress: u8,
        message: Option<String>,
    },
    JobCompleted {
        job: Job,
    },
    JobFailed {
        job: Job,
    },
    JobCancelled {
        job: Job,
    },
    QueueEmpty,
    QueuePaused,
    QueueResumed,
    CostUpdated {
        total_spend: f64,
        budget_limit: Option<f64>,
        occurred_at: DateTime<Utc>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::JobCreated { .. } => EventKind::JobCreated,
            Event::JobStarted { .. } => EventKind::JobStarted,
            Event::JobProgress { .. } => EventKind::JobProgress,
            Event::JobCompleted { .. } => EventKind::JobCompleted,
            Event::JobFailed { .. } => EventKind::JobFailed,
            Event::JobCancelled { .. } => EventKind::JobCancelled,
            Event::QueueEmpty => EventKind::QueueEmpty,
            Event::QueuePaused => EventKind::QueuePaused,
            Event::QueueResumed => EventKind::QueueResumed,
            Event::CostUpdated { .. } => EventKind::CostUpdated,
        }
    }

    /// Stable event name/type identifier (e.g. "job:completed").
    pub fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }

    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::JobCreated { job }
            | Event::JobStarted { job }
            | Event::JobCompleted { job }
            | Event::JobFailed { job }
            | Event::JobCancelled { job } => Some(job.id),
            Event::JobProgress { job_id, .. } => Some(*job_id),
            _ => None,
        }
    }

    pub fn cost_updated(total_spend: f64, budget_limit: Option<f64>) -> Self {
        Event::CostUpdated {
            total_spend,
            budget_limit,
            occurred_at: Utc::now(),
        }
    }
}
