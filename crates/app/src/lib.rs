//! `notewise-app`
//!
//! Wires the core together for a host application:
//!
//! - [`AppConfig`]: JSON configuration plus `NOTEWISE_*` environment overrides
//! - [`AppContext`]: owns the event bus, cost ledger, orchestrator and scheduler, and
//!   registers the built-in feature executors
//! - [`executors`]: `content-analysis` and `permanent-note`

pub mod config;
pub mod context;
pub mod error;
pub mod executors;

pub use config::{AppConfig, BackoffConfig, ConfigError, RetryConfig, SchedulerSection};
pub use context::{AppContext, CHARS_PER_TOKEN, estimate_tokens};
pub use error::AppError;
pub use executors::{
    ContentAnalysisExecutor, NoteSuggestion, PermanentNote, PermanentNoteExecutor,
    executor_error, parse_suggestions,
};
