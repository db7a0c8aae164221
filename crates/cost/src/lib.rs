//! `notewise-cost`: usage accounting and the budget oracle.
//!
//! The [`CostLedger`] is the only place spend is recorded. It prices usage with a
//! [`RateTable`], keeps an append-only list of [`UsageRecord`]s and answers "may we
//! spend more?" for the orchestration layer.

pub mod ledger;
pub mod rates;

pub use ledger::{BudgetExceeded, CostError, CostLedger, CostSummary, UsageRecord};
pub use rates::{ModelRate, RateTable};
