//! Per-model pricing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use notewise_core::{DomainError, DomainResult};

/// Published rates and limits for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRate {
    /// USD per one million input tokens.
    #[serde(rename = "inputCostPer1M")]
    pub input_cost_per_1m: f64,
    /// USD per one million output tokens.
    #[serde(rename = "outputCostPer1M")]
    pub output_cost_per_1m: f64,
    #[serde(rename = "maxInputTokens")]
    pub max_input_tokens: u32,
    #[serde(rename = "maxOutputTokens")]
    pub max_output_tokens: u32,
}

impl ModelRate {
    pub const fn new(
        input_cost_per_1m: f64,
        output_cost_per_1m: f64,
        max_input_tokens: u32,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            input_cost_per_1m,
            output_cost_per_1m,
            max_input_tokens,
            max_output_tokens,
        }
    }

    /// `(in / 1e6) * in_rate + (out / 1e6) * out_rate`.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_1m
            + (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_1m
    }

    /// Prices must be finite and non-negative, or spend could go down.
    pub fn validate(&self) -> DomainResult<()> {
        for (name, value) in [
            ("inputCostPer1M", self.input_cost_per_1m),
            ("outputCostPer1M", self.output_cost_per_1m),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DomainError::validation(format!(
                    "{name} must be a finite non-negative amount (got {value})"
                )));
            }
        }
        Ok(())
    }
}

const BUILTIN_RATES: &[(&str, ModelRate)] = &[
    ("claude-3-5-sonnet-20241022", ModelRate::new(3.0, 15.0, 200_000, 8_192)),
    ("claude-3-5-haiku-20241022", ModelRate::new(0.8, 4.0, 200_000, 8_192)),
    ("claude-3-opus-20240229", ModelRate::new(15.0, 75.0, 200_000, 4_096)),
    ("gpt-4o", ModelRate::new(2.5, 10.0, 128_000, 16_384)),
    ("gpt-4o-mini", ModelRate::new(0.15, 0.6, 128_000, 16_384)),
    ("gpt-4-turbo", ModelRate::new(10.0, 30.0, 128_000, 4_096)),
    ("gemini-1.5-pro", ModelRate::new(1.25, 5.0, 2_097_152, 8_192)),
    ("gemini-1.5-flash", ModelRate::new(0.075, 0.3, 1_048_576, 8_192)),
];

/// Model id → rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RateTable {
    rates: HashMap<String, ModelRate>,
}

impl Default for RateTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl RateTable {
    /// A table with no entries (every model prices at zero).
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// Rates for the models the built-in providers ship with.
    pub fn builtin() -> Self {
        Self {
            rates: BUILTIN_RATES
                .iter()
                .map(|(model, rate)| ((*model).to_string(), *rate))
                .collect(),
        }
    }

    pub fn with_rate(mut self, model: impl Into<String>, rate: ModelRate) -> Self {
        self.insert(model, rate);
        self
    }

    pub fn insert(&mut self, model: impl Into<String>, rate: ModelRate) -> Option<ModelRate> {
        self.rates.insert(model.into(), rate)
    }

    /// Add or override every entry of `other`.
    pub fn merge(&mut self, other: RateTable) {
        self.rates.extend(other.rates);
    }

    pub fn get(&self, model: &str) -> Option<&ModelRate> {
        self.rates.get(model)
    }

    /// Price a call, or `None` if the model has no published rate.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.get(model).map(|r| r.cost(input_tokens, output_tokens))
    }

    /// Check every entry, reporting the first bad model in name order.
    pub fn validate(&self) -> DomainResult<()> {
        let mut models: Vec<_> = self.rates.iter().collect();
        models.sort_by(|a, b| a.0.cmp(b.0));
        for (model, rate) in models {
            rate.validate()
                .map_err(|e| DomainError::validation(format!("rate for {model}: {e}")))?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}
