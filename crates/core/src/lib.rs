//! `notewise-core`: shared building blocks.
//!
//! This crate contains the **job data model** and the error/identifier primitives every
//! other crate speaks in. It has no runtime or IO concerns.

pub mod error;
pub mod id;
pub mod job;

pub use error::{DomainError, DomainResult};
pub use id::JobId;
pub use job::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, Job, JobStatus};
