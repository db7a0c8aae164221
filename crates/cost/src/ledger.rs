//! Append-only usage ledger with an optional spending ceiling.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use notewise_core::DomainError;
use notewise_events::{Event, EventBus};

use crate::rates::{ModelRate, RateTable};

/// One priced LLM call. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// USD.
    pub cost: f64,
    pub feature: String,
    pub timestamp: DateTime<Utc>,
}

/// Raised when spend has reached the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("budget exceeded: spent ${current_spend:.4} of ${limit:.4} limit")]
pub struct BudgetExceeded {
    pub current_spend: f64,
    pub limit: f64,
}

impl BudgetExceeded {
    /// `Err` when `current_spend` is at or above `limit`.
    pub fn check(current_spend: f64, limit: Option<f64>) -> Result<(), BudgetExceeded> {
        match limit {
            Some(limit) if current_spend >= limit => Err(BudgetExceeded {
                current_spend,
                limit,
            }),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CostError {
    #[error(transparent)]
    BudgetExceeded(#[from] BudgetExceeded),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Read-only projection of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CostSummary {
    pub total_spend: f64,
    pub budget_limit: Option<f64>,
    pub remaining: Option<f64>,
    pub record_count: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub by_provider: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
    pub by_feature: BTreeMap<String, f64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: Vec<UsageRecord>,
    total_spend: f64,
    budget_limit: Option<f64>,
}

/// Records usage, computes spend and acts as the budget oracle.
///
/// Spend covers the lifetime of the ledger; there is no periodic reset.
#[derive(Debug)]
pub struct CostLedger {
    rates: RwLock<RateTable>,
    state: Mutex<LedgerState>,
    bus: EventBus,
}

impl CostLedger {
    pub fn new(bus: EventBus, rates: RateTable) -> Self {
        Self {
            rates: RwLock::new(rates),
            state: Mutex::new(LedgerState::default()),
            bus,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Price and record one call, then publish `cost:updated`.
    pub fn track_usage(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        feature: &str,
    ) -> UsageRecord {
        let cost = self.estimate_cost(model, input_tokens, output_tokens);

        let record = UsageRecord {
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost,
            feature: feature.to_string(),
            timestamp: Utc::now(),
        };

        let (total_spend, budget_limit) = {
            let mut state = self.state();
            state.records.push(record.clone());
            state.total_spend = state.records.iter().map(|r| r.cost).sum();
            (state.total_spend, state.budget_limit)
        };

        debug!(
            provider,
            model,
            feature,
            input_tokens,
            output_tokens,
            cost,
            total_spend,
            "usage tracked"
        );

        if let Some(limit) = budget_limit {
            if total_spend >= limit {
                warn!(total_spend, limit, "budget limit reached");
            }
        }

        self.bus.publish(Event::cost_updated(total_spend, budget_limit));
        record
    }

    /// Price a call without recording it. Unknown models cost nothing.
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let rates = self.rates.read().unwrap_or_else(PoisonError::into_inner);
        match rates.cost(model, input_tokens, output_tokens) {
            Some(cost) => cost,
            None => {
                warn!(model, "no rate published for model; pricing usage at zero");
                0.0
            }
        }
    }

    pub fn current_spend(&self) -> f64 {
        self.state().total_spend
    }

    pub fn budget_limit(&self) -> Option<f64> {
        self.state().budget_limit
    }

    /// Update the ceiling; `None` means unlimited.
    pub fn set_budget_limit(&self, limit: Option<f64>) -> Result<(), CostError> {
        if let Some(l) = limit {
            if !l.is_finite() || l < 0.0 {
                return Err(DomainError::validation(format!(
                    "budget limit must be a finite non-negative amount (got {l})"
                ))
                .into());
            }
        }

        let total_spend = {
            let mut state = self.state();
            state.budget_limit = limit;
            state.total_spend
        };

        info!(budget_limit = ?limit, total_spend, "budget limit updated");
        self.bus.publish(Event::cost_updated(total_spend, limit));
        Ok(())
    }

    pub fn remaining_budget(&self) -> Option<f64> {
        let state = self.state();
        state
            .budget_limit
            .map(|limit| (limit - state.total_spend).max(0.0))
    }

    pub fn is_budget_exceeded(&self) -> bool {
        self.check_budget().is_err()
    }

    pub fn check_budget(&self) -> Result<(), BudgetExceeded> {
        let state = self.state();
        BudgetExceeded::check(state.total_spend, state.budget_limit)
    }

    /// Snapshot of every record, oldest first.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.state().records.clone()
    }

    /// Replace the rate table. Already recorded costs are not re-priced.
    pub fn set_rates(&self, rates: RateTable) {
        *self.rates.write().unwrap_or_else(PoisonError::into_inner) = rates;
    }

    /// Published rate for one model.
    pub fn rate_for(&self, model: &str) -> Option<ModelRate> {
        self.rates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(model)
            .copied()
    }

    pub fn rates(&self) -> RateTable {
        self.rates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn summarize(&self) -> CostSummary {
        let state = self.state();
        let mut summary = CostSummary {
            total_spend: state.total_spend,
            budget_limit: state.budget_limit,
            remaining: state
                .budget_limit
                .map(|limit| (limit - state.total_spend).max(0.0)),
            record_count: state.records.len(),
            ..CostSummary::default()
        };

        for r in &state.records {
            summary.total_input_tokens += r.input_tokens;
            summary.total_output_tokens += r.output_tokens;
            *summary.by_provider.entry(r.provider.clone()).or_default() += r.cost;
            *summary.by_model.entry(r.model.clone()).or_default() += r.cost;
            *summary.by_feature.entry(r.feature.clone()).or_default() += r.cost;
        }

        summary
    }
}
