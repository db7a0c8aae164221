//! Provider adapter contract.
//!
//! One implementation per LLM backend lives outside this crate (HTTP signing, streaming
//! and vendor payloads are the adapter's business). Adapters are expected to bound their
//! own network calls; a timeout is reported like any other failure.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::AiError;
use crate::message::Message;

/// Tokens consumed by one call, if the backend reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Fully resolved request options handed to an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Vendor-specific passthrough parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, JsonValue>,
}

impl RequestOptions {
    pub fn for_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: None,
            max_tokens: None,
            extra: Map::new(),
        }
    }
}

/// Caller-supplied overrides, merged over the resolved defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra: Map<String, JsonValue>,
}

impl GenerateOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Merge these overrides over `default_model`.
    pub fn resolve(self, default_model: &str) -> RequestOptions {
        RequestOptions {
            model: self.model.unwrap_or_else(|| default_model.to_string()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            extra: self.extra,
        }
    }
}

/// Uniform response shape of every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub success: bool,
    pub content: String,
    pub tokens_used: Option<TokenUsage>,
    pub error: Option<String>,
}

impl LlmResponse {
    pub fn ok(content: impl Into<String>, tokens_used: Option<TokenUsage>) -> Self {
        Self {
            success: true,
            content: content.into(),
            tokens_used,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            tokens_used: None,
            error: Some(error.into()),
        }
    }

    /// Turn an unsuccessful response into an error, keeping successful ones.
    pub fn into_result(self, provider: &str) -> Result<LlmResponse, AiError> {
        if self.success {
            Ok(self)
        } else {
            Err(AiError::ProviderFailed {
                provider: provider.to_string(),
                message: self
                    .error
                    .unwrap_or_else(|| "unknown provider error".to_string()),
            })
        }
    }
}

/// One LLM backend.
#[async_trait]
pub trait LlmProvider: Send + Sync + 'static {
    /// Registry key (e.g. "anthropic").
    fn id(&self) -> &str;

    /// Model used when settings name none for this provider.
    fn default_model(&self) -> &str;

    async fn generate(
        &self,
        messages: &[Message],
        api_key: &str,
        options: &RequestOptions,
    ) -> LlmResponse;

    /// Validate a credential against the backend.
    async fn test_api_key(&self, api_key: &str) -> bool;
}

/// Provider adapters keyed by id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl core::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, returning the one it replaced.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) -> Option<Arc<dyn LlmProvider>> {
        self.providers.insert(provider.id().to_string(), provider)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.providers.keys().cloned().collect();
        ids.sort();
        ids
    }
}
