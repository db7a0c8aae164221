//! Application configuration.
//!
//! One JSON document, camelCase keys, every section optional:
//!
//! ```json
//! {
//!   "settings": { "provider": "anthropic", "apiKeys": { "anthropic": "sk-..." } },
//!   "scheduler": { "defaultMaxRetries": 2, "retry": { "kind": "backoff", "baseDelayMs": 500 } },
//!   "rates": { "my-model": { "inputCostPer1M": 1.0, "outputCostPer1M": 2.0,
//!              "maxInputTokens": 32000, "maxOutputTokens": 4000 } },
//!   "logging": { "format": "pretty", "filter": "info,notewise_jobs=debug" },
//!   "maxContentTokens": 50000
//! }
//! ```
//!
//! Environment overrides (see [`AppConfig::apply_env_overrides`]) are applied on top.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use notewise_ai::AiSettings;
use notewise_cost::RateTable;
use notewise_core::{DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY};
use notewise_jobs::{
    BackoffPolicy, BackoffStrategy, DelayedBackoff, FailFastOnBudget, ImmediateRequeue,
    RequeueByPriority, RetryStrategy, SchedulerConfig,
};
use notewise_observability::LogConfig;

pub const ENV_PROVIDER: &str = "NOTEWISE_PROVIDER";
pub const ENV_BUDGET_LIMIT: &str = "NOTEWISE_BUDGET_LIMIT";
/// Prefix of per-provider credentials, e.g. `NOTEWISE_API_KEY_OPENAI`.
pub const ENV_API_KEY_PREFIX: &str = "NOTEWISE_API_KEY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {var}: {reason}")]
    InvalidEnv { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Backoff parameters as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            strategy: policy.strategy,
            jitter: policy.jitter,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            strategy: self.strategy,
            jitter: self.jitter,
        }
    }
}

/// Where retried jobs go.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetryConfig {
    #[default]
    Immediate,
    ByPriority,
    Backoff(BackoffConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSection {
    pub default_priority: i32,
    pub default_max_retries: u32,
    pub history_limit: usize,
    pub retry: RetryConfig,
    /// Stop retrying as soon as the budget is exhausted.
    pub fail_fast_on_budget: bool,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            default_priority: DEFAULT_PRIORITY,
            default_max_retries: DEFAULT_MAX_RETRIES,
            history_limit: SchedulerConfig::default().history_limit,
            retry: RetryConfig::default(),
            fail_fast_on_budget: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    /// Persisted AI settings (provider, keys, models, feature overrides, budget).
    pub settings: AiSettings,
    pub scheduler: SchedulerSection,
    /// Added to (or overriding) the built-in rate table.
    pub rates: RateTable,
    pub logging: LogConfig,
    /// Ceiling on submitted content, in estimated tokens. Defaults to the feature
    /// model's input limit.
    pub max_content_tokens: Option<u32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            settings: AiSettings::default(),
            scheduler: SchedulerSection::default(),
            rates: RateTable::empty(),
            logging: LogConfig::default(),
            max_content_tokens: None,
        }
    }
}

impl AppConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_overrides(std::env::vars())
    }

    /// Apply `NOTEWISE_*` overrides from `vars`; other names are ignored.
    ///
    /// - `NOTEWISE_PROVIDER`: active provider id (empty clears it)
    /// - `NOTEWISE_BUDGET_LIMIT`: USD amount, or empty / `none` for unlimited
    /// - `NOTEWISE_API_KEY_<PROVIDER>`: credential for the lowercased provider id
    pub fn apply_env_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (name, value) in vars {
            let name = name.as_ref();
            if name == ENV_PROVIDER {
                let value: String = value.into();
                let value = value.trim();
                self.settings.provider = (!value.is_empty()).then(|| value.to_string());
            } else if name == ENV_BUDGET_LIMIT {
                let value: String = value.into();
                self.settings.budget_limit = parse_budget(&value)?;
            } else if let Some(provider) = name.strip_prefix(ENV_API_KEY_PREFIX) {
                if provider.is_empty() {
                    return Err(ConfigError::InvalidEnv {
                        var: name.to_string(),
                        reason: "missing provider name".to_string(),
                    });
                }
                self.settings
                    .api_keys
                    .insert(provider.to_ascii_lowercase(), value.into());
            }
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(limit) = self.settings.budget_limit {
            if !limit.is_finite() || limit < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "budgetLimit must be a finite non-negative amount (got {limit})"
                )));
            }
        }
        if self.max_content_tokens == Some(0) {
            return Err(ConfigError::Invalid(
                "maxContentTokens must be greater than zero".to_string(),
            ));
        }
        if let RetryConfig::Backoff(backoff) = &self.scheduler.retry {
            if !(0.0..=1.0).contains(&backoff.jitter) {
                return Err(ConfigError::Invalid(format!(
                    "retry jitter must be between 0 and 1 (got {})",
                    backoff.jitter
                )));
            }
            if backoff.max_delay_ms < backoff.base_delay_ms {
                return Err(ConfigError::Invalid(
                    "retry maxDelayMs must not be below baseDelayMs".to_string(),
                ));
            }
        }
        self.rates
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            default_priority: self.scheduler.default_priority,
            default_max_retries: self.scheduler.default_max_retries,
            history_limit: self.scheduler.history_limit,
        }
    }

    pub fn retry_strategy(&self) -> Arc<dyn RetryStrategy> {
        fn wrap<S: RetryStrategy>(strategy: S, fail_fast: bool) -> Arc<dyn RetryStrategy> {
            if fail_fast {
                Arc::new(FailFastOnBudget::new(strategy))
            } else {
                Arc::new(strategy)
            }
        }

        let fail_fast = self.scheduler.fail_fast_on_budget;
        match &self.scheduler.retry {
            RetryConfig::Immediate => wrap(ImmediateRequeue, fail_fast),
            RetryConfig::ByPriority => wrap(RequeueByPriority, fail_fast),
            RetryConfig::Backoff(backoff) => wrap(DelayedBackoff::new(backoff.policy()), fail_fast),
        }
    }

    /// Built-in rates with the configured overrides applied.
    pub fn rate_table(&self) -> RateTable {
        let mut table = RateTable::builtin();
        table.merge(self.rates.clone());
        table
    }
}

fn parse_budget(raw: &str) -> Result<Option<f64>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let invalid = |reason: String| ConfigError::InvalidEnv {
        var: ENV_BUDGET_LIMIT.to_string(),
        reason,
    };
    let limit: f64 = raw
        .parse()
        .map_err(|e| invalid(format!("{raw:?} is not a number ({e})")))?;
    if !limit.is_finite() || limit < 0.0 {
        return Err(invalid(format!("{raw:?} is not a non-negative amount")));
    }
    Ok(Some(limit))
}
