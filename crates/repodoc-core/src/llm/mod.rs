//! Model hub: the single boundary to language-model providers.
//!
//! A model id from the catalog resolves to a provider, a credential and
//! per-token pricing. The hub exposes two pure request/response operations,
//! [`ModelHub::complete`] and [`ModelHub::embed`], and normalizes every
//! provider's answer into a [`ModelReply`].
//!
//! Supported providers:
//!
//! - **Anthropic**: Claude models via the Messages API
//! - **OpenAI**: GPT models via Chat Completions and Embeddings (also
//!   compatible with Ollama, vLLM, Together AI and other OpenAI-compatible
//!   endpoints)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ┌─────────────────┐
//! │ DocAgent     │  │ RetrievalIndex  │   callers own retry policy
//! └──────┬───────┘  └────────┬────────┘
//!        └─────────┬─────────┘
//!                  ▼
//!           ┌────────────┐
//!           │  ModelHub  │   model id → provider + pricing
//!           └─────┬──────┘
//!     ┌───────────┼─────────────┐
//!     ▼           ▼             ▼
//! ┌─────────┐ ┌─────────┐ ┌──────────┐
//! │Anthropic│ │ OpenAI  │ │ Scripted │
//! └─────────┘ └─────────┘ └──────────┘
//! ```
//!
//! The hub never retries. Failures are classified ([`LlmError::is_fatal`],
//! [`LlmError::is_retryable`]) and the caller decides, usually through
//! [`retry::with_retry`].

pub mod anthropic;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod scripted;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use repodoc_config::{AppConfig, ModelConfig, ProviderKind};
use tracing::debug;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use provider::{LlmError, LlmProvider};
pub use retry::{RetryPolicy, with_retry};
pub use scripted::{ScriptStep, ScriptedProvider};
pub use types::*;

use crate::ledger::RateTable;

/// Create the provider for one catalog entry.
///
/// The credential is read by the caller; an empty key makes every call fail
/// with [`LlmError::Auth`].
pub fn create_provider(config: &ModelConfig, api_key: String) -> Arc<dyn LlmProvider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.provider {
        ProviderKind::Anthropic => {
            let mut provider = AnthropicProvider::new(api_key).with_timeout(timeout);
            if let Some(ref base_url) = config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Arc::new(provider)
        }
        ProviderKind::OpenAi => {
            let mut provider = OpenAiProvider::new(api_key).with_timeout(timeout);
            if let Some(ref base_url) = config.base_url {
                provider = provider.with_base_url(base_url);
            }
            Arc::new(provider)
        }
    }
}

/// A catalog entry bound to its provider.
#[derive(Clone)]
struct ModelEntry {
    config: ModelConfig,
    provider: Arc<dyn LlmProvider>,
}

/// Maps model ids to providers and pricing.
///
/// Cheap to clone and safe to share between concurrent runs: it holds no
/// per-call mutable state.
#[derive(Clone)]
pub struct ModelHub {
    entries: HashMap<String, ModelEntry>,
    max_tokens: u32,
    temperature: f32,
}

impl ModelHub {
    /// An empty hub. Register models with [`with_model`](Self::with_model).
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            max_tokens: 4096,
            temperature: 0.0,
        }
    }

    /// Build a hub for every model in the catalog, reading each credential
    /// from its configured environment variable.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut hub = Self::new().with_generation(config.agent.max_tokens, config.agent.temperature);
        for model in &config.models {
            let api_key = std::env::var(model.api_key_env()).unwrap_or_default();
            if api_key.is_empty() {
                debug!(model = %model.id, env = model.api_key_env(), "no credential in environment");
            }
            let provider = create_provider(model, api_key);
            hub = hub.with_model(model.clone(), provider);
        }
        hub
    }

    /// Register (or replace) a model served by `provider`.
    pub fn with_model(mut self, config: ModelConfig, provider: Arc<dyn LlmProvider>) -> Self {
        self.entries
            .insert(config.id.clone(), ModelEntry { config, provider });
        self
    }

    /// Set completion length and sampling temperature.
    pub fn with_generation(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }

    /// Whether `model` is in the catalog.
    pub fn contains(&self, model: &str) -> bool {
        self.entries.contains_key(model)
    }

    /// Catalog entry for `model`.
    pub fn model_config(&self, model: &str) -> Result<&ModelConfig, LlmError> {
        self.entry(model).map(|e| &e.config)
    }

    /// Per-token pricing of every registered model.
    pub fn rate_table(&self) -> RateTable {
        RateTable::from_models(self.entries.values().map(|e| &e.config))
    }

    fn entry(&self, model: &str) -> Result<&ModelEntry, LlmError> {
        self.entries
            .get(model)
            .ok_or_else(|| LlmError::UnknownModel(model.to_string()))
    }

    /// Ask `model` for its next turn given the conversation so far.
    pub async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, LlmError> {
        let entry = self.entry(model)?;
        let request = ChatRequest {
            model: entry.config.upstream_model().to_string(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: None,
        };
        debug!(
            model,
            provider = entry.provider.name(),
            messages = messages.len(),
            tools = tools.len(),
            "completion request"
        );
        let response = entry.provider.chat(&request).await?;
        Ok(ModelReply::from_response(model, response))
    }

    /// Embed `texts` with the embedding model configured for `model`.
    pub async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let entry = self.entry(model)?;
        let embedding_model = entry.config.embedding_model.clone().ok_or_else(|| {
            LlmError::Unsupported(format!("model {model} has no embedding model configured"))
        })?;
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let request = EmbedRequest {
            model: embedding_model,
            texts: texts.to_vec(),
        };
        let vectors = entry.provider.embed(&request).await?;
        if vectors.len() != texts.len() {
            return Err(LlmError::Parse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        Ok(vectors)
    }
}

impl Default for ModelHub {
    fn default() -> Self {
        Self::new()
    }
}
