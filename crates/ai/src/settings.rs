//! Settings consumed by the orchestrator.
//!
//! The JSON shape matches what the host persists (camelCase keys). Loading and saving it
//! is the host's job; this module only reads it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Well-known feature names.
pub mod features {
    /// Bulk analysis of a note into atomic-note suggestions.
    pub const CONTENT_ANALYSIS: &str = "content-analysis";
    /// Writing a single permanent note.
    pub const PERMANENT_NOTE: &str = "permanent-note";
}

/// Provider/model pair bound to a feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureModel {
    pub provider: String,
    pub model: String,
}

impl FeatureModel {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiSettings {
    /// Globally active provider id.
    #[serde(default)]
    pub provider: Option<String>,
    /// provider id → credential
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
    /// provider id → model id
    #[serde(default)]
    pub models: HashMap<String, String>,
    /// feature name → provider/model override
    #[serde(default)]
    pub feature_models: HashMap<String, FeatureModel>,
    #[serde(default)]
    pub budget_limit: Option<f64>,
}

impl AiSettings {
    /// Non-empty credential for `provider`.
    pub fn api_key_for(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
    }

    pub fn model_for(&self, provider: &str) -> Option<&str> {
        self.models
            .get(provider)
            .map(String::as_str)
            .filter(|m| !m.is_empty())
    }

    pub fn active_provider(&self) -> Option<&str> {
        self.provider.as_deref().filter(|p| !p.is_empty())
    }

    pub fn feature_model(&self, feature: &str) -> Option<&FeatureModel> {
        self.feature_models.get(feature)
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_api_key(mut self, provider: impl Into<String>, key: impl Into<String>) -> Self {
        self.api_keys.insert(provider.into(), key.into());
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(provider.into(), model.into());
        self
    }

    pub fn with_feature_model(mut self, feature: impl Into<String>, model: FeatureModel) -> Self {
        self.feature_models.insert(feature.into(), model);
        self
    }

    pub fn with_budget_limit(mut self, limit: Option<f64>) -> Self {
        self.budget_limit = limit;
        self
    }
}
