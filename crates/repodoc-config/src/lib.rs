#![deny(unsafe_code)]

//! Configuration loading and validation for repodoc.
//!
//! Loads TOML configuration files and validates them before any run starts.
//! [`AppConfig`] is the single configuration value handed to the model hub,
//! the documentation agent and the retrieval index. Nothing here is global:
//! every run receives its own copy.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Why a configuration could not be used.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Everything `repodoc.toml` can set. Every table is optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model id used when a command does not name one.
    #[serde(default = "default_model_id")]
    pub default_model: String,

    /// Model catalog. Each entry maps a model id to a provider, a
    /// credential source and per-token pricing.
    #[serde(default = "default_models")]
    pub models: Vec<ModelConfig>,

    /// Documentation agent bounds.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool registry limits.
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Retrieval index and chat settings.
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Caller-side retry policy for model calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Run artifact output.
    #[serde(default)]
    pub output: OutputConfig,

    /// Console log filter.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_model: default_model_id(),
            models: default_models(),
            agent: AgentConfig::default(),
            tools: ToolsConfig::default(),
            retrieval: RetrievalConfig::default(),
            retry: RetryConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_model_id() -> String {
    "gpt-3.5-turbo-0125".to_string()
}

/// Which wire protocol a model is reached through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    /// OpenAI Chat Completions and Embeddings, or any compatible endpoint.
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic Messages API.
    #[serde(rename = "anthropic")]
    Anthropic,
}

impl ProviderKind {
    /// Environment variable holding the credential when a model entry does
    /// not name one.
    pub fn default_api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

/// One entry of the model catalog.
///
/// ## TOML Example
///
/// ```toml
/// [[models]]
/// id = "local-llama"
/// provider = "openai"
/// base_url = "http://localhost:11434/v1"
/// upstream_model = "llama3"
/// embedding_model = "nomic-embed-text"
/// rate_in = 0.0
/// rate_out = 0.0
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Identifier used on the command line and in the ledger.
    pub id: String,

    pub provider: ProviderKind,

    /// Environment variable the API key is read from.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Override of the provider's API base URL.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Model name sent upstream, when it differs from `id`.
    #[serde(default)]
    pub upstream_model: Option<String>,

    /// Embedding model used by the retrieval index for this entry.
    #[serde(default)]
    pub embedding_model: Option<String>,

    /// Cost per prompt token.
    #[serde(default)]
    pub rate_in: f64,

    /// Cost per completion token.
    #[serde(default)]
    pub rate_out: f64,

    /// Per-request network timeout in seconds.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl ModelConfig {
    pub fn new(id: &str, provider: ProviderKind) -> Self {
        Self {
            id: id.to_string(),
            provider,
            api_key_env: None,
            base_url: None,
            upstream_model: None,
            embedding_model: None,
            rate_in: 0.0,
            rate_out: 0.0,
            timeout_secs: default_model_timeout_secs(),
        }
    }

    /// Set the per-token rates.
    pub fn with_rates(mut self, rate_in: f64, rate_out: f64) -> Self {
        self.rate_in = rate_in;
        self.rate_out = rate_out;
        self
    }

    /// Set the embedding model.
    pub fn with_embedding_model(mut self, model: &str) -> Self {
        self.embedding_model = Some(model.to_string());
        self
    }

    /// Route the entry through an OpenAI-compatible endpoint.
    pub fn with_endpoint(mut self, base_url: &str, api_key_env: &str) -> Self {
        self.base_url = Some(base_url.to_string());
        self.api_key_env = Some(api_key_env.to_string());
        self
    }

    pub fn with_upstream_model(mut self, model: &str) -> Self {
        self.upstream_model = Some(model.to_string());
        self
    }

    /// The environment variable the credential is read from.
    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.provider.default_api_key_env())
    }

    /// The model name sent to the provider.
    pub fn upstream_model(&self) -> &str {
        self.upstream_model.as_deref().unwrap_or(&self.id)
    }
}

fn default_model_timeout_secs() -> u64 {
    120
}

fn default_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig::new("gpt-3.5-turbo-0125", ProviderKind::OpenAi)
            .with_rates(5e-7, 1.5e-6)
            .with_embedding_model("text-embedding-3-small"),
        ModelConfig::new("gpt-4o-mini", ProviderKind::OpenAi)
            .with_rates(1.5e-7, 6e-7)
            .with_embedding_model("text-embedding-3-small"),
        ModelConfig::new("claude-3-opus-20240229", ProviderKind::Anthropic)
            .with_rates(1.5e-5, 7.5e-5),
        ModelConfig::new("claude-3-sonnet-20240229", ProviderKind::Anthropic)
            .with_rates(3e-6, 1.5e-5),
        ModelConfig::new("claude-3-haiku-20240307", ProviderKind::Anthropic)
            .with_rates(2.5e-7, 1.25e-6),
        ModelConfig::new("groq/openai/gpt-oss-120b", ProviderKind::OpenAi)
            .with_endpoint(GROQ_API_BASE, "GROQ_API_KEY")
            .with_upstream_model("openai/gpt-oss-120b"),
        ModelConfig::new("gemini/gemini-pro", ProviderKind::OpenAi)
            .with_endpoint(GEMINI_API_BASE, "GEMINI_API_KEY")
            .with_upstream_model("gemini-pro")
            .with_rates(3.5e-8, 7e-7),
        ModelConfig::new("gemini/gemini-1.5-pro-latest", ProviderKind::OpenAi)
            .with_endpoint(GEMINI_API_BASE, "GEMINI_API_KEY")
            .with_upstream_model("gemini-1.5-pro-latest")
            .with_rates(1.05e-6, 2.1e-6),
    ]
}

const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Bounds for the documentation agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of model turns per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    /// Consecutive tool or provider failures tolerated before the run fails.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Maximum number of documentation sections per run.
    #[serde(default = "default_max_sections")]
    pub max_sections: usize,

    /// Maximum size of a single section body in bytes.
    #[serde(default = "default_max_section_bytes")]
    pub max_section_bytes: usize,

    /// Completion token limit per model call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_sections: default_max_sections(),
            max_section_bytes: default_max_section_bytes(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
        }
    }
}

fn default_max_steps() -> u32 {
    10
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_max_sections() -> usize {
    64
}

fn default_max_section_bytes() -> usize {
    64 * 1024
}

fn default_max_tokens() -> u32 {
    4096
}

/// Limits applied by the tool registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Bytes returned by `read_file` before the content is truncated.
    #[serde(default = "default_max_read_bytes")]
    pub max_read_bytes: usize,

    #[serde(default = "default_max_search_results")]
    pub max_search_results: usize,

    #[serde(default = "default_max_list_entries")]
    pub max_list_entries: usize,

    /// Characters of a tool result kept in the call ledger.
    #[serde(default = "default_result_summary_chars")]
    pub result_summary_chars: usize,

    /// Directory names skipped by `list_files` and `search_code`.
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_read_bytes: default_max_read_bytes(),
            max_search_results: default_max_search_results(),
            max_list_entries: default_max_list_entries(),
            result_summary_chars: default_result_summary_chars(),
            exclude_dirs: default_exclude_dirs(),
        }
    }
}

fn default_max_read_bytes() -> usize {
    64 * 1024
}

fn default_max_search_results() -> usize {
    50
}

fn default_max_list_entries() -> usize {
    500
}

fn default_result_summary_chars() -> usize {
    2000
}

fn default_exclude_dirs() -> Vec<String> {
    [
        "__pycache__",
        ".venv",
        ".git",
        ".idea",
        "venv",
        "env",
        "node_modules",
        "dist",
        "build",
        ".vscode",
        ".github",
        ".gitlab",
        "target",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Retrieval index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Chunk length in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive chunks.
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Chunks retrieved per query.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Upper bound on the assembled context block, in characters.
    #[serde(default = "default_context_budget_chars")]
    pub context_budget_chars: usize,

    /// Root directory of persisted indexes.
    #[serde(default = "default_store_dir")]
    pub store_dir: String,

    /// Texts per embedding request.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    /// Embedding requests in flight during a build.
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,

    /// How long a session waits for another session's build.
    #[serde(default = "default_build_wait_timeout_secs")]
    pub build_wait_timeout_secs: u64,

    /// File extensions eligible for indexing, with leading dot.
    #[serde(default = "default_allow_extensions")]
    pub allow_extensions: Vec<String>,

    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,

    /// File names never indexed.
    #[serde(default = "default_exclude_files")]
    pub exclude_files: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            context_budget_chars: default_context_budget_chars(),
            store_dir: default_store_dir(),
            embed_batch_size: default_embed_batch_size(),
            embed_concurrency: default_embed_concurrency(),
            build_wait_timeout_secs: default_build_wait_timeout_secs(),
            allow_extensions: default_allow_extensions(),
            exclude_dirs: default_exclude_dirs(),
            exclude_files: default_exclude_files(),
        }
    }
}

fn default_chunk_size() -> usize {
    2056
}

fn default_chunk_overlap() -> usize {
    256
}

fn default_top_k() -> usize {
    3
}

fn default_context_budget_chars() -> usize {
    12_000
}

fn default_store_dir() -> String {
    "data/indexes".to_string()
}

fn default_embed_batch_size() -> usize {
    32
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_build_wait_timeout_secs() -> u64 {
    600
}

fn default_allow_extensions() -> Vec<String> {
    [
        ".txt", ".md", ".csv", ".js", ".mjs", ".ts", ".tsx", ".css", ".scss", ".less", ".html",
        ".htm", ".json", ".py", ".java", ".c", ".cpp", ".cs", ".go", ".php", ".rb", ".rs",
        ".swift", ".kt", ".scala", ".m", ".h", ".sh", ".pl", ".pm", ".lua", ".sql", ".ipynb",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exclude_files() -> Vec<String> {
    [
        "requirements.txt",
        "package.json",
        "package-lock.json",
        "yarn.lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Bounded exponential backoff applied by callers of the model hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

/// Where run directories are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_output_dir() -> String {
    "runs".to_string()
}

/// The `[logging]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Read and validate the file at `path`.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), models = config.models.len(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Look up a model entry by id.
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Reject values no run could use: empty catalogs, zero limits, unknown
    /// defaults.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for (i, model) in self.models.iter().enumerate() {
            if model.id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "models[{i}].id must not be empty"
                )));
            }
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "models[{i}].id {:?} is defined more than once",
                    model.id
                )));
            }
            if model.rate_in < 0.0 || model.rate_out < 0.0 {
                return Err(ConfigError::Validation(format!(
                    "models[{i}] rates must not be negative"
                )));
            }
            if model.timeout_secs == 0 {
                return Err(ConfigError::Validation(format!(
                    "models[{i}].timeout_secs must be non-zero"
                )));
            }
        }
        if self.model(&self.default_model).is_none() {
            return Err(ConfigError::Validation(format!(
                "default_model {:?} is not in the model catalog",
                self.default_model
            )));
        }

        if self.agent.max_steps == 0 {
            return Err(ConfigError::Validation(
                "agent.max_steps must be at least 1".to_string(),
            ));
        }
        if self.agent.max_consecutive_failures == 0 {
            return Err(ConfigError::Validation(
                "agent.max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        if self.agent.max_sections == 0 || self.agent.max_section_bytes == 0 {
            return Err(ConfigError::Validation(
                "agent.max_sections and agent.max_section_bytes must be non-zero".to_string(),
            ));
        }

        if self.tools.max_read_bytes == 0 {
            return Err(ConfigError::Validation(
                "tools.max_read_bytes must be non-zero".to_string(),
            ));
        }

        let r = &self.retrieval;
        if r.chunk_size == 0 {
            return Err(ConfigError::Validation(
                "retrieval.chunk_size must be non-zero".to_string(),
            ));
        }
        if r.chunk_overlap >= r.chunk_size {
            return Err(ConfigError::Validation(format!(
                "retrieval.chunk_overlap ({}) must be smaller than retrieval.chunk_size ({})",
                r.chunk_overlap, r.chunk_size
            )));
        }
        if r.top_k == 0 {
            return Err(ConfigError::Validation(
                "retrieval.top_k must be at least 1".to_string(),
            ));
        }
        if r.embed_batch_size == 0 || r.embed_concurrency == 0 {
            return Err(ConfigError::Validation(
                "retrieval.embed_batch_size and retrieval.embed_concurrency must be at least 1"
                    .to_string(),
            ));
        }
        if r.store_dir.is_empty() {
            return Err(ConfigError::Validation(
                "retrieval.store_dir must not be empty".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.initial_backoff_ms, self.retry.max_backoff_ms
            )));
        }

        if self.output.dir.is_empty() {
            return Err(ConfigError::Validation(
                "output.dir must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
