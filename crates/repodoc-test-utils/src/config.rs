//! Configuration builders for tests.
//!
//! Use [`TestConfigBuilder`] to create customised [`AppConfig`] values without
//! repeating boilerplate across crate boundaries.

use repodoc_config::{AppConfig, ModelConfig, ProviderKind};

/// Fluent builder for [`AppConfig`] in tests.
///
/// # Example
///
/// ```ignore
/// let config = TestConfigBuilder::new()
///     .model(ModelConfig::new("stub", ProviderKind::OpenAi).with_rates(1e-6, 2e-6))
///     .max_steps(5)
///     .build();
/// ```
pub struct TestConfigBuilder {
    config: AppConfig,
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: AppConfig::default(),
        }
    }

    /// Add a catalog entry and make it the default model.
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.config.default_model = model.id.clone();
        self.config.models.retain(|m| m.id != model.id);
        self.config.models.push(model);
        self
    }

    /// An OpenAI-compatible model with an embedding model and flat rates.
    pub fn stub_model(self, id: &str) -> Self {
        self.model(
            ModelConfig::new(id, ProviderKind::OpenAi)
                .with_embedding_model("stub-embed")
                .with_rates(0.000_001, 0.000_002),
        )
    }

    pub fn max_steps(mut self, n: u32) -> Self {
        self.config.agent.max_steps = n;
        self
    }

    pub fn max_consecutive_failures(mut self, n: u32) -> Self {
        self.config.agent.max_consecutive_failures = n;
        self
    }

    pub fn max_read_bytes(mut self, n: usize) -> Self {
        self.config.tools.max_read_bytes = n;
        self
    }

    pub fn chunking(mut self, size: usize, overlap: usize) -> Self {
        self.config.retrieval.chunk_size = size;
        self.config.retrieval.chunk_overlap = overlap;
        self
    }

    pub fn top_k(mut self, k: usize) -> Self {
        self.config.retrieval.top_k = k;
        self
    }

    pub fn store_dir(mut self, dir: &str) -> Self {
        self.config.retrieval.store_dir = dir.to_string();
        self
    }

    pub fn output_dir(mut self, dir: &str) -> Self {
        self.config.output.dir = dir.to_string();
        self
    }

    /// Retry without sleeping between attempts.
    pub fn fast_retry(mut self, max_attempts: u32) -> Self {
        self.config.retry.max_attempts = max_attempts;
        self.config.retry.initial_backoff_ms = 0;
        self.config.retry.max_backoff_ms = 0;
        self
    }

    pub fn log_level(mut self, level: &str) -> Self {
        self.config.logging.level = level.to_string();
        self
    }

    pub fn build(self) -> AppConfig {
        self.config
    }
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
