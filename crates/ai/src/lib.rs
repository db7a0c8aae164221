//! `notewise-ai`
//!
//! **Responsibility:** the single entry point for model completions.
//!
//! - Provider adapters implement [`LlmProvider`]; this crate never talks to a vendor API
//!   itself.
//! - The [`Orchestrator`] picks provider and model per feature, refuses calls once the
//!   budget is spent, and forwards everything else to the adapter.

pub mod error;
pub mod message;
pub mod orchestrator;
pub mod provider;
pub mod settings;

pub use error::AiError;
pub use message::{Message, Role};
pub use orchestrator::{DEFAULT_SYSTEM_PROMPT, FeatureResponse, Orchestrator};
pub use provider::{
    GenerateOptions, LlmProvider, LlmResponse, ProviderRegistry, RequestOptions, TokenUsage,
};
pub use settings::{AiSettings, FeatureModel, features};
