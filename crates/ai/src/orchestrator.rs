//! Orchestration facade: provider/model resolution, the budget gate, and dispatch to the
//! selected adapter.
//!
//! ## Failure modes
//!
//! - Configuration problems (no provider selected, provider not registered, missing
//!   credential) are returned as `Ok(LlmResponse { success: false, .. })`. Callers show
//!   the message and move on. [`Orchestrator::generate_for_feature`] raises them as
//!   [`AiError::NotConfigured`] instead.
//! - A spent budget is raised as `Err(AiError::BudgetExceeded)` before the adapter is
//!   touched.
//!
//! Locks are only held while resolving the route; no lock is held across the adapter
//! call.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use notewise_cost::{BudgetExceeded, CostLedger, ModelRate, RateTable};

use crate::error::AiError;
use crate::message::Message;
use crate::provider::{GenerateOptions, LlmProvider, LlmResponse, ProviderRegistry};
use crate::settings::{AiSettings, FeatureModel};

/// System prompt used by feature requests that do not supply one.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a careful assistant helping the user build a personal knowledge base of concise, well-linked notes.";

/// A resolved provider + model + credential.
struct Route {
    provider: Arc<dyn LlmProvider>,
    model: String,
    api_key: String,
}

/// Response of a feature request together with the route that served it.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureResponse {
    pub provider: String,
    pub model: String,
    pub response: LlmResponse,
}

#[derive(Debug)]
pub struct Orchestrator {
    settings: RwLock<AiSettings>,
    providers: RwLock<ProviderRegistry>,
    rates: RwLock<RateTable>,
    ledger: Option<Arc<CostLedger>>,
}

impl Orchestrator {
    pub fn new(settings: AiSettings, rates: RateTable) -> Self {
        Self {
            settings: RwLock::new(settings),
            providers: RwLock::new(ProviderRegistry::new()),
            rates: RwLock::new(rates),
            ledger: None,
        }
    }

    /// Use `ledger` for spend lookups and pricing.
    pub fn with_ledger(mut self, ledger: Arc<CostLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn register_provider(&self, provider: Arc<dyn LlmProvider>) {
        let id = provider.id().to_string();
        let replaced = self
            .providers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(provider);
        if replaced.is_some() {
            warn!(provider = %id, "provider adapter replaced");
        } else {
            info!(provider = %id, "provider adapter registered");
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids()
    }

    pub fn settings(&self) -> AiSettings {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn update_settings(&self, settings: AiSettings) {
        debug!(provider = ?settings.provider, "ai settings updated");
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    pub fn set_rates(&self, rates: RateTable) {
        *self.rates.write().unwrap_or_else(PoisonError::into_inner) = rates;
    }

    /// Provider/model for `feature`, falling back to the active provider and its model.
    pub fn resolve_feature(&self, feature: &str) -> Option<FeatureModel> {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(fm) = settings.feature_model(feature) {
            return Some(fm.clone());
        }

        let provider = settings.active_provider()?;
        let model = match settings.model_for(provider) {
            Some(model) => model.to_string(),
            None => self.get_provider(provider)?.default_model().to_string(),
        };
        Some(FeatureModel::new(provider, model))
    }

    /// Model of the globally active provider.
    pub fn active_model(&self) -> Option<String> {
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        let provider = settings.active_provider()?;
        match settings.model_for(provider) {
            Some(model) => Some(model.to_string()),
            None => self
                .get_provider(provider)
                .map(|p| p.default_model().to_string()),
        }
    }

    fn get_provider(&self, id: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
    }

    fn route(
        &self,
        settings: &AiSettings,
        provider_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<Route, LlmResponse> {
        let Some(provider_id) = provider_id else {
            return Err(LlmResponse::failure("No AI provider selected"));
        };
        let Some(provider) = self.get_provider(provider_id) else {
            return Err(LlmResponse::failure(format!(
                "AI provider '{provider_id}' is not available"
            )));
        };
        let Some(api_key) = settings.api_key_for(provider_id) else {
            return Err(LlmResponse::failure(format!(
                "No API key configured for {provider_id}"
            )));
        };

        let model = model
            .map(str::to_string)
            .or_else(|| settings.model_for(provider_id).map(str::to_string))
            .unwrap_or_else(|| provider.default_model().to_string());

        Ok(Route {
            provider,
            model,
            api_key: api_key.to_string(),
        })
    }

    fn check_budget(
        &self,
        settings_limit: Option<f64>,
        current_spend: Option<f64>,
    ) -> Result<(), BudgetExceeded> {
        let limit = settings_limit.or_else(|| self.ledger.as_ref().and_then(|l| l.budget_limit()));
        let spend = current_spend.or_else(|| self.ledger.as_ref().map(|l| l.current_spend()));

        match spend {
            Some(spend) => BudgetExceeded::check(spend, limit).inspect_err(|e| {
                warn!(current_spend = e.current_spend, limit = e.limit, "request blocked by budget");
            }),
            None => Ok(()),
        }
    }

    /// Send `messages` to the globally active provider.
    pub async fn generate_text(
        &self,
        messages: &[Message],
        options: GenerateOptions,
        current_spend: Option<f64>,
    ) -> Result<LlmResponse, AiError> {
        let (route, budget_limit) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            (
                self.route(&settings, settings.active_provider(), None),
                settings.budget_limit,
            )
        };

        let route = match route {
            Ok(route) => route,
            Err(response) => {
                warn!(error = ?response.error, "generate_text not configured");
                return Ok(response);
            }
        };

        self.check_budget(budget_limit, current_spend)?;

        let request = options.resolve(&route.model);
        debug!(
            provider = route.provider.id(),
            model = %request.model,
            messages = messages.len(),
            "generate_text"
        );

        Ok(route
            .provider
            .generate(messages, &route.api_key, &request)
            .await)
    }

    /// Send `messages` using the provider/model bound to `feature`.
    ///
    /// Unlike the other request helpers, a missing provider or credential is raised as
    /// [`AiError::NotConfigured`] so job executors can fail without retrying.
    pub async fn generate_for_feature(
        &self,
        feature: &str,
        messages: &[Message],
        options: GenerateOptions,
    ) -> Result<FeatureResponse, AiError> {
        let (route, budget_limit) = {
            let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
            let route = match settings.feature_model(feature) {
                Some(fm) => self.route(&settings, Some(&fm.provider), Some(&fm.model)),
                None => self.route(&settings, settings.active_provider(), None),
            };
            (route, settings.budget_limit)
        };

        let route = match route {
            Ok(route) => route,
            Err(response) => {
                let message = response.error.unwrap_or_default();
                warn!(feature, error = %message, "feature request not configured");
                return Err(AiError::NotConfigured(message));
            }
        };

        self.check_budget(budget_limit, None)?;

        let request = options.resolve(&route.model);
        debug!(
            feature,
            provider = route.provider.id(),
            model = %request.model,
            "generate_for_feature"
        );

        let response = route
            .provider
            .generate(messages, &route.api_key, &request)
            .await;

        Ok(FeatureResponse {
            provider: route.provider.id().to_string(),
            model: request.model,
            response,
        })
    }

    /// Two-message (system + user) request for `feature`.
    pub async fn simple_generate_for_feature(
        &self,
        feature: &str,
        user_prompt: &str,
        system_prompt: Option<&str>,
        options: GenerateOptions,
    ) -> Result<LlmResponse, AiError> {
        let messages = [
            Message::system(system_prompt.unwrap_or(DEFAULT_SYSTEM_PROMPT)),
            Message::user(user_prompt),
        ];
        match self.generate_for_feature(feature, &messages, options).await {
            Ok(routed) => Ok(routed.response),
            Err(AiError::NotConfigured(message)) => Ok(LlmResponse::failure(message)),
            Err(e) => Err(e),
        }
    }

    fn rate_for(&self, model: &str) -> Option<ModelRate> {
        match &self.ledger {
            Some(ledger) => ledger.rate_for(model),
            None => self
                .rates
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(model)
                .copied(),
        }
    }

    /// Price a call on the active model. Unknown or unset models price at zero.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        self.active_model()
            .and_then(|model| self.rate_for(&model))
            .map_or(0.0, |rate| rate.cost(input_tokens, output_tokens))
    }

    /// Price a call on the model bound to `feature`.
    pub fn estimate_feature_cost(&self, feature: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.resolve_feature(feature)
            .and_then(|fm| self.rate_for(&fm.model))
            .map_or(0.0, |rate| rate.cost(input_tokens, output_tokens))
    }

    /// Input ceiling of the model bound to `feature`, if it has a published rate.
    pub fn feature_input_limit(&self, feature: &str) -> Option<u32> {
        self.resolve_feature(feature)
            .and_then(|fm| self.rate_for(&fm.model))
            .map(|rate| rate.max_input_tokens)
    }

    /// Ask a registered provider whether `api_key` is valid.
    pub async fn test_api_key(&self, provider_id: &str, api_key: &str) -> bool {
        match self.get_provider(provider_id) {
            Some(provider) => provider.test_api_key(api_key).await,
            None => false,
        }
    }
}
