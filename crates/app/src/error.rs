use thiserror::Error;

use notewise_core::DomainError;
use notewise_cost::CostError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Cost(#[from] CostError),
}

impl AppError {
    /// Input was rejected before any job was created.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::Domain(DomainError::Validation(_))
                | AppError::Cost(CostError::Domain(DomainError::Validation(_)))
        )
    }
}
