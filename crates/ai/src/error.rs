use thiserror::Error;

use notewise_cost::BudgetExceeded;

/// Failures raised (rather than returned as unsuccessful responses) by the AI layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AiError {
    /// Spend has reached the configured ceiling; no request was sent.
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    /// No provider, adapter or credential for the request. Retrying will not help.
    #[error("{0}")]
    NotConfigured(String),

    /// The provider answered with `success = false`.
    #[error("provider {provider} failed: {message}")]
    ProviderFailed { provider: String, message: String },

    /// The provider answered, but the content was not what the caller asked for.
    #[error("invalid model output: {0}")]
    InvalidOutput(String),
}

impl AiError {
    pub fn is_budget_exceeded(&self) -> bool {
        matches!(self, AiError::BudgetExceeded(_))
    }
}
