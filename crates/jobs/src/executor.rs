//! Executor contract and progress port.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use notewise_cost::BudgetExceeded;

/// Why an execution attempt failed.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Spend reached the ceiling before the attempt could call a model.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// Backend or output problem that may go away on another attempt.
    #[error("{0}")]
    Transient(String),

    /// Bad input or missing configuration. The job fails without retrying.
    #[error("{0}")]
    Permanent(String),

    /// The executor panicked; the payload message is preserved.
    #[error("executor panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ExecutorError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, ExecutorError::BudgetExceeded(_))
    }

    /// Whether the retry budget applies. Only permanent errors skip it.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutorError::Permanent(_))
    }
}

/// Receiver of progress reports for one running job.
pub trait ProgressSink: Send + Sync {
    fn report(&self, progress: u8, message: Option<String>);
}

/// Progress port handed to every executor invocation.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

struct Discard;

impl ProgressSink for Discard {
    fn report(&self, _progress: u8, _message: Option<String>) {}
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self { sink }
    }

    /// A reporter that drops everything.
    pub fn noop() -> Self {
        Self::new(Arc::new(Discard))
    }

    /// Report percent complete (0-100, values above are clamped).
    pub fn report(&self, progress: u8) {
        self.sink.report(progress, None);
    }

    pub fn report_with(&self, progress: u8, message: impl Into<String>) {
        self.sink.report(progress, Some(message.into()));
    }
}

/// Produces a job's result from its data.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(
        &self,
        data: JsonValue,
        progress: ProgressReporter,
    ) -> Result<JsonValue, ExecutorError>;
}

/// Adapts an async closure to [`JobExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobExecutor for FnExecutor<F>
where
    F: Fn(JsonValue, ProgressReporter) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<JsonValue, ExecutorError>> + Send + 'static,
{
    async fn execute(
        &self,
        data: JsonValue,
        progress: ProgressReporter,
    ) -> Result<JsonValue, ExecutorError> {
        (self.f)(data, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording(Mutex<Vec<(u8, Option<String>)>>);

    impl ProgressSink for Recording {
        fn report(&self, progress: u8, message: Option<String>) {
            self.0.lock().unwrap().push((progress, message));
        }
    }

    #[tokio::test]
    async fn fn_executor_forwards_data_and_progress() {
        let sink = Arc::new(Recording::default());
        let executor = FnExecutor::new(|data: JsonValue, progress: ProgressReporter| async move {
            progress.report_with(50, "half");
            Ok::<_, ExecutorError>(serde_json::json!({ "echo": data["n"] }))
        });

        let result = executor
            .execute(serde_json::json!({ "n": 7 }), ProgressReporter::new(sink.clone()))
            .await
            .unwrap();

        assert_eq!(result["echo"], 7);
        assert_eq!(*sink.0.lock().unwrap(), vec![(50, Some("half".to_string()))]);
    }

    #[test]
    fn classification() {
        let budget = ExecutorError::from(BudgetExceeded {
            current_spend: 1.0,
            limit: 1.0,
        });
        assert!(budget.is_budget_exceeded());
        assert!(budget.is_retryable());

        assert!(!ExecutorError::permanent("no content").is_retryable());
        assert!(ExecutorError::transient("timeout").is_retryable());

        let other = ExecutorError::from(anyhow::anyhow!("disk full"));
        assert_eq!(other.to_string(), "disk full");
        assert!(other.is_retryable());
    }
}
