use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use notewise_ai::{AiSettings, LlmProvider, Orchestrator, features};
use notewise_core::{DomainError, DomainResult, Job};
use notewise_cost::CostLedger;
use notewise_events::EventBus;
use notewise_jobs::Scheduler;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::executors::{ContentAnalysisExecutor, PermanentNoteExecutor};

/// Characters per token used to estimate content size before calling a model.
pub const CHARS_PER_TOKEN: usize = 4;

/// Rough token count of `content`.
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Everything the application needs, built once and passed around explicitly.
///
/// Bus, ledger, orchestrator and scheduler are shared handles; cloning the pieces out of
/// the context is cheap.
#[derive(Debug)]
pub struct AppContext {
    bus: EventBus,
    ledger: Arc<CostLedger>,
    orchestrator: Arc<Orchestrator>,
    scheduler: Scheduler,
    max_content_tokens: Option<u32>,
}

impl AppContext {
    /// Install logging as configured, then build the context.
    pub fn bootstrap(config: AppConfig) -> Result<Self, AppError> {
        notewise_observability::init_with(&config.logging);
        Self::new(config)
    }

    /// Build the context and register the built-in executors.
    ///
    /// Executors run on the Tokio runtime current at this call (or at dispatch time).
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        config.validate()?;

        let bus = EventBus::new();
        let rates = config.rate_table();
        let ledger = Arc::new(CostLedger::new(bus.clone(), rates.clone()));
        ledger.set_budget_limit(config.settings.budget_limit)?;

        let orchestrator =
            Arc::new(Orchestrator::new(config.settings.clone(), rates).with_ledger(ledger.clone()));
        let scheduler = Scheduler::with_retry_strategy(
            bus.clone(),
            config.scheduler_config(),
            config.retry_strategy(),
        );

        scheduler.register_executor(
            features::CONTENT_ANALYSIS,
            Arc::new(ContentAnalysisExecutor::new(orchestrator.clone(), ledger.clone())),
        );
        scheduler.register_executor(
            features::PERMANENT_NOTE,
            Arc::new(PermanentNoteExecutor::new(orchestrator.clone(), ledger.clone())),
        );

        info!(
            provider = ?config.settings.provider,
            budget_limit = ?config.settings.budget_limit,
            retry = ?config.scheduler.retry,
            "application context ready"
        );

        Ok(Self {
            bus,
            ledger,
            orchestrator,
            scheduler,
            max_content_tokens: config.max_content_tokens,
        })
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn register_provider(&self, provider: Arc<dyn LlmProvider>) {
        self.orchestrator.register_provider(provider);
    }

    /// Replace the AI settings, keeping the ledger's budget in step.
    pub fn apply_settings(&self, settings: AiSettings) -> Result<(), AppError> {
        self.ledger.set_budget_limit(settings.budget_limit)?;
        self.orchestrator.update_settings(settings);
        Ok(())
    }

    /// Queue a `content-analysis` job after checking the content fits the model.
    pub fn submit_content_analysis(&self, content: &str, title: Option<&str>) -> Result<Job, AppError> {
        self.check_content(features::CONTENT_ANALYSIS, content)?;
        Ok(self.scheduler.enqueue(
            features::CONTENT_ANALYSIS,
            json!({ "content": content, "title": title }),
            None,
        ))
    }

    /// Queue a `permanent-note` job after checking the content fits the model.
    pub fn submit_permanent_note(
        &self,
        content: &str,
        title: Option<&str>,
        context: Option<&str>,
    ) -> Result<Job, AppError> {
        match context {
            Some(context) => self.check_content(features::PERMANENT_NOTE, &format!("{content}\n{context}"))?,
            None => self.check_content(features::PERMANENT_NOTE, content)?,
        }

        Ok(self.scheduler.enqueue(
            features::PERMANENT_NOTE,
            json!({ "content": content, "title": title, "context": context }),
            None,
        ))
    }

    fn check_content(&self, feature: &str, content: &str) -> DomainResult<()> {
        if content.trim().is_empty() {
            return Err(DomainError::validation("content must not be empty"));
        }

        let limit = self
            .max_content_tokens
            .or_else(|| self.orchestrator.feature_input_limit(feature));
        let Some(limit) = limit else {
            return Ok(());
        };

        let estimated = estimate_tokens(content);
        if estimated > limit as usize {
            warn!(feature, estimated, limit, "content rejected: too large");
            return Err(DomainError::validation(format!(
                "content is too large for {feature}: about {estimated} tokens, limit is {limit}"
            )));
        }
        Ok(())
    }
}
