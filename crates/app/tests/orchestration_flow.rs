use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use notewise_ai::{AiSettings, LlmProvider, LlmResponse, Message, RequestOptions, TokenUsage};
use notewise_app::{AppConfig, AppContext, RetryConfig};
use notewise_core::JobStatus;
use notewise_events::{Event, EventKind};

const MODEL: &str = "claude-3-5-sonnet-20241022";

/// Replays queued responses, then repeats the fallback.
struct ScriptedProvider {
    responses: Mutex<VecDeque<LlmResponse>>,
    fallback: LlmResponse,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    fn new(responses: Vec<LlmResponse>, fallback: LlmResponse) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            fallback,
            calls: AtomicUsize::new(0),
        })
    }

    fn always(response: LlmResponse) -> Arc<Self> {
        Self::new(Vec::new(), response)
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        "anthropic"
    }

    fn default_model(&self) -> &str {
        MODEL
    }

    async fn generate(&self, _messages: &[Message], _api_key: &str, _options: &RequestOptions) -> LlmResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }

    async fn test_api_key(&self, api_key: &str) -> bool {
        !api_key.is_empty()
    }
}

fn settings() -> AiSettings {
    AiSettings::default()
        .with_provider("anthropic")
        .with_api_key("anthropic", "sk-test")
        .with_model("anthropic", MODEL)
}

fn config() -> AppConfig {
    AppConfig {
        settings: settings(),
        ..AppConfig::default()
    }
}

fn context(config: AppConfig, provider: Arc<ScriptedProvider>) -> AppContext {
    let ctx = AppContext::new(config).unwrap();
    ctx.register_provider(provider);
    ctx
}

#[tokio::test]
async fn content_analysis_runs_end_to_end() {
    let provider = ScriptedProvider::always(LlmResponse::ok(
        "```json\n[{\"title\": \"Atomic notes\", \"summary\": \"One idea per note.\", \"keyPoints\": [\"small\", \"linked\"]}]\n```",
        Some(TokenUsage::new(1_000, 500)),
    ));
    let ctx = context(config(), provider.clone());
    let events = ctx.bus().stream();

    let job = ctx
        .submit_content_analysis("Notes should hold exactly one idea each.", Some("Zettelkasten"))
        .unwrap();
    ctx.scheduler().wait_until_idle().await;

    let done = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.progress, 100);
    let result = done.result.unwrap();
    assert_eq!(result["suggestions"][0]["title"], "Atomic notes");
    assert_eq!(result["suggestions"][0]["keyPoints"][1], "linked");
    assert_eq!(provider.calls(), 1);

    let records = ctx.ledger().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].feature, "content-analysis");
    assert_eq!(records[0].model, MODEL);
    assert!((ctx.ledger().current_spend() - 0.0105).abs() < 1e-9);

    let kinds: Vec<EventKind> = events.drain().iter().map(Event::kind).collect();
    assert_eq!(kinds.first(), Some(&EventKind::JobCreated));
    assert!(kinds.contains(&EventKind::CostUpdated));
    let completed = kinds.iter().position(|k| *k == EventKind::JobCompleted).unwrap();
    let cost = kinds.iter().position(|k| *k == EventKind::CostUpdated).unwrap();
    assert!(cost < completed);
    assert_eq!(kinds.last(), Some(&EventKind::QueueEmpty));
}

#[tokio::test]
async fn malformed_output_is_retried_then_fails() {
    let provider = ScriptedProvider::always(LlmResponse::ok(
        "I found a few ideas but cannot format them.",
        Some(TokenUsage::new(100, 20)),
    ));
    let ctx = context(config(), provider.clone());

    let job = ctx.submit_content_analysis("Some note text.", None).unwrap();
    ctx.scheduler().wait_until_idle().await;

    let failed = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(failed.error.unwrap().contains("not valid JSON"));
    assert_eq!(provider.calls(), 4);
    // every attempt is billed, usable or not
    assert_eq!(ctx.ledger().records().len(), 4);
}

#[tokio::test]
async fn recovers_after_a_provider_failure() {
    let provider = ScriptedProvider::new(
        vec![LlmResponse::failure("rate limited")],
        LlmResponse::ok("{\"suggestions\": [{\"title\": \"T\", \"summary\": \"S\"}]}", None),
    );
    let ctx = context(config(), provider.clone());

    let job = ctx.submit_content_analysis("Retry me.", None).unwrap();
    ctx.scheduler().wait_until_idle().await;

    let done = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.retry_count, 1);
    assert_eq!(provider.calls(), 2);
    assert_eq!(ctx.scheduler().status().stats.retried, 1);
}

#[tokio::test]
async fn exhausted_budget_blocks_model_calls() {
    let provider = ScriptedProvider::always(LlmResponse::ok("[]", None));
    let ctx = context(config(), provider.clone());
    ctx.apply_settings(settings().with_budget_limit(Some(0.0))).unwrap();
    assert_eq!(ctx.ledger().budget_limit(), Some(0.0));

    let job = ctx.submit_content_analysis("Anything.", None).unwrap();
    ctx.scheduler().wait_until_idle().await;

    let failed = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    // retried like any other failure by default
    assert_eq!(failed.retry_count, 4);
    assert!(failed.error.unwrap().contains("budget exceeded"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn fail_fast_on_budget_skips_retries() {
    let mut config = config();
    config.scheduler.fail_fast_on_budget = true;
    config.scheduler.retry = RetryConfig::ByPriority;
    config.settings.budget_limit = Some(0.0);

    let provider = ScriptedProvider::always(LlmResponse::ok("[]", None));
    let ctx = context(config, provider.clone());

    let job = ctx.submit_content_analysis("Anything.", None).unwrap();
    ctx.scheduler().wait_until_idle().await;

    let failed = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 1);
    assert_eq!(ctx.scheduler().status().stats.retried, 0);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn missing_api_key_fails_without_retrying() {
    let mut config = config();
    config.settings.api_keys.clear();

    let provider = ScriptedProvider::always(LlmResponse::ok("[]", None));
    let ctx = context(config, provider.clone());

    let job = ctx.submit_content_analysis("Anything.", None).unwrap();
    ctx.scheduler().wait_until_idle().await;

    let failed = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);
    assert_eq!(failed.error.as_deref(), Some("No API key configured for anthropic"));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn oversized_or_empty_content_is_rejected_up_front() {
    let mut config = config();
    config.max_content_tokens = Some(10);
    let ctx = context(config, ScriptedProvider::always(LlmResponse::ok("[]", None)));

    let err = ctx.submit_content_analysis(&"x".repeat(100), None).unwrap_err();
    assert!(err.is_validation());
    assert!(err.to_string().contains("too large"));

    let err = ctx.submit_permanent_note("   ", None, None).unwrap_err();
    assert!(err.is_validation());

    // context counts toward the size
    let err = ctx
        .submit_permanent_note("short idea", None, Some(&"y".repeat(60)))
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(ctx.scheduler().status().stats.enqueued, 0);
    assert!(ctx.scheduler().pending_jobs().is_empty());
}

#[tokio::test]
async fn permanent_note_takes_title_from_heading() {
    let provider = ScriptedProvider::always(LlmResponse::ok(
        "# Ideas compound\n\nEach linked note makes the next one cheaper to write.",
        Some(TokenUsage::new(200, 100)),
    ));
    let ctx = context(config(), provider);

    let job = ctx
        .submit_permanent_note("Linking notes makes writing easier.", None, Some("From a book on writing"))
        .unwrap();
    ctx.scheduler().wait_until_idle().await;

    let done = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    let note = done.result.unwrap();
    assert_eq!(note["title"], "Ideas compound");
    assert!(note["content"].as_str().unwrap().starts_with("# Ideas compound"));
    assert_eq!(ctx.ledger().records()[0].feature, "permanent-note");
}

#[tokio::test]
async fn bootstrap_builds_a_working_context() {
    let config = AppConfig::from_json(
        r#"{
            "settings": { "provider": "anthropic", "apiKeys": { "anthropic": "sk-test" } },
            "scheduler": { "defaultMaxRetries": 1, "retry": { "kind": "by-priority" } },
            "logging": { "format": "pretty", "filter": "warn" }
        }"#,
    )
    .unwrap();
    let ctx = AppContext::bootstrap(config).unwrap();
    ctx.register_provider(ScriptedProvider::always(LlmResponse::failure("down")));

    assert_eq!(ctx.scheduler().config().default_max_retries, 1);
    assert_eq!(ctx.orchestrator().provider_ids(), vec!["anthropic".to_string()]);

    let job = ctx.submit_content_analysis("Anything.", None).unwrap();
    assert_eq!(job.max_retries, 1);
    ctx.scheduler().wait_until_idle().await;

    let failed = ctx.scheduler().get(job.id).unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 2);
}
