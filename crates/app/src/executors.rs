//! Built-in executors for the knowledge-management features.
//!
//! Both call the feature-bound model through the [`Orchestrator`] and record reported
//! token usage in the [`CostLedger`], whether or not the response was usable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use notewise_ai::{
    AiError, FeatureResponse, GenerateOptions, LlmResponse, Message, Orchestrator, features,
};
use notewise_cost::CostLedger;
use notewise_jobs::{ExecutorError, JobExecutor, ProgressReporter};

const ANALYSIS_SYSTEM_PROMPT: &str = "You split notes into atomic ideas. \
Answer with JSON only: an array of objects with the keys \"title\" (short, specific), \
\"summary\" (one or two sentences) and \"keyPoints\" (array of short strings).";

const PERMANENT_NOTE_SYSTEM_PROMPT: &str = "You write permanent notes for a Zettelkasten. \
A permanent note states one idea in your own words, is understandable without its source \
and is written in Markdown. Start with a level-one heading that names the idea.";

/// Map an orchestration failure onto the scheduler's retry classes.
pub fn executor_error(err: AiError) -> ExecutorError {
    match err {
        AiError::BudgetExceeded(budget) => ExecutorError::BudgetExceeded(budget),
        AiError::NotConfigured(message) => ExecutorError::Permanent(message),
        other => ExecutorError::Transient(other.to_string()),
    }
}

fn parse_input<T: DeserializeOwned>(job_type: &str, data: JsonValue) -> Result<T, ExecutorError> {
    serde_json::from_value(data)
        .map_err(|e| ExecutorError::permanent(format!("invalid {job_type} job data: {e}")))
}

fn record_usage(ledger: &CostLedger, routed: &FeatureResponse, feature: &str) {
    if let Some(usage) = routed.response.tokens_used {
        ledger.track_usage(
            &routed.provider,
            &routed.model,
            usage.input_tokens,
            usage.output_tokens,
            feature,
        );
    }
}

/// Send one feature request, record its usage and keep only successful responses.
async fn run_feature(
    orchestrator: &Orchestrator,
    ledger: &CostLedger,
    feature: &str,
    messages: &[Message],
    options: GenerateOptions,
) -> Result<LlmResponse, ExecutorError> {
    let routed = orchestrator
        .generate_for_feature(feature, messages, options)
        .await
        .map_err(executor_error)?;
    record_usage(ledger, &routed, feature);
    routed
        .response
        .into_result(&routed.provider)
        .map_err(executor_error)
}

#[derive(Debug, Deserialize)]
struct ContentAnalysisInput {
    content: String,
    #[serde(default)]
    title: Option<String>,
}

/// One atomic-note suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteSuggestion {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SuggestionPayload {
    List(Vec<NoteSuggestion>),
    Wrapped { suggestions: Vec<NoteSuggestion> },
}

/// Strip a Markdown code fence around the payload, if there is one.
fn unfence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[start + 3..];
    // skip the info string ("json") up to the end of the fence line
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after,
    };
    match body.rfind("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parse model output into suggestions. Accepts a bare array, `{"suggestions": [...]}`
/// and either of those inside a code fence.
pub fn parse_suggestions(content: &str) -> Result<Vec<NoteSuggestion>, AiError> {
    let payload: SuggestionPayload = serde_json::from_str(unfence(content))
        .map_err(|e| AiError::InvalidOutput(format!("suggestions are not valid JSON: {e}")))?;
    let suggestions = match payload {
        SuggestionPayload::List(list) => list,
        SuggestionPayload::Wrapped { suggestions } => suggestions,
    };
    if suggestions.is_empty() {
        return Err(AiError::InvalidOutput("model returned no suggestions".into()));
    }
    Ok(suggestions)
}

/// `content-analysis`: `{content, title?}` → `{suggestions: [{title, summary, keyPoints}]}`.
pub struct ContentAnalysisExecutor {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<CostLedger>,
}

impl ContentAnalysisExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>, ledger: Arc<CostLedger>) -> Self {
        Self {
            orchestrator,
            ledger,
        }
    }
}

#[async_trait]
impl JobExecutor for ContentAnalysisExecutor {
    async fn execute(
        &self,
        data: JsonValue,
        progress: ProgressReporter,
    ) -> Result<JsonValue, ExecutorError> {
        let input: ContentAnalysisInput = parse_input(features::CONTENT_ANALYSIS, data)?;
        if input.content.trim().is_empty() {
            return Err(ExecutorError::permanent("content must not be empty"));
        }

        progress.report_with(10, "Preparing analysis");
        let user_prompt = match input.title.as_deref() {
            Some(title) => format!("Note title: {title}\n\n{}", input.content),
            None => input.content,
        };
        let messages = [
            Message::system(ANALYSIS_SYSTEM_PROMPT),
            Message::user(user_prompt),
        ];

        progress.report_with(30, "Waiting for the model");
        let response = run_feature(
            &self.orchestrator,
            &self.ledger,
            features::CONTENT_ANALYSIS,
            &messages,
            GenerateOptions::default().with_temperature(0.3),
        )
        .await?;

        progress.report_with(80, "Parsing suggestions");
        let suggestions = parse_suggestions(&response.content).map_err(executor_error)?;
        debug!(count = suggestions.len(), "content analysed");

        Ok(serde_json::json!({ "suggestions": suggestions }))
    }
}

#[derive(Debug, Deserialize)]
struct PermanentNoteInput {
    content: String,
    #[serde(default)]
    title: Option<String>,
    /// Surrounding notes or the source the idea came from.
    #[serde(default)]
    context: Option<String>,
}

/// Generated permanent note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermanentNote {
    pub title: String,
    pub content: String,
}

impl PermanentNote {
    /// Use the given title, else the first Markdown heading, else a placeholder.
    fn from_output(title: Option<String>, output: &str) -> Self {
        let content = output.trim().to_string();
        let title = title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| {
                content
                    .lines()
                    .find_map(|line| line.trim().strip_prefix("# "))
                    .map(|h| h.trim().to_string())
            })
            .unwrap_or_else(|| "Untitled note".to_string());
        Self { title, content }
    }
}

/// `permanent-note`: `{content, title?, context?}` → `{title, content}`.
pub struct PermanentNoteExecutor {
    orchestrator: Arc<Orchestrator>,
    ledger: Arc<CostLedger>,
}

impl PermanentNoteExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>, ledger: Arc<CostLedger>) -> Self {
        Self {
            orchestrator,
            ledger,
        }
    }
}

#[async_trait]
impl JobExecutor for PermanentNoteExecutor {
    async fn execute(
        &self,
        data: JsonValue,
        progress: ProgressReporter,
    ) -> Result<JsonValue, ExecutorError> {
        let input: PermanentNoteInput = parse_input(features::PERMANENT_NOTE, data)?;
        if input.content.trim().is_empty() {
            return Err(ExecutorError::permanent("content must not be empty"));
        }

        let mut prompt = String::new();
        if let Some(title) = input.title.as_deref() {
            prompt.push_str(&format!("Title: {title}\n\n"));
        }
        prompt.push_str(&format!("Idea:\n{}\n", input.content));
        if let Some(context) = input.context.as_deref() {
            prompt.push_str(&format!("\nContext:\n{context}\n"));
        }
        let messages = [
            Message::system(PERMANENT_NOTE_SYSTEM_PROMPT),
            Message::user(prompt),
        ];

        progress.report_with(20, "Writing note");
        let response = run_feature(
            &self.orchestrator,
            &self.ledger,
            features::PERMANENT_NOTE,
            &messages,
            GenerateOptions::default().with_temperature(0.7),
        )
        .await?;

        if response.content.trim().is_empty() {
            return Err(executor_error(AiError::InvalidOutput(
                "model returned an empty note".into(),
            )));
        }

        let note = PermanentNote::from_output(input.title, &response.content);
        serde_json::to_value(note).map_err(|e| ExecutorError::Other(e.into()))
    }
}
