//! Retrieval index and question answering over a document folder.
//!
//! ```text
//! folder ──collect──► documents ──chunk──► chunks ──embed (batched, parallel)──► VectorIndex
//!                                                                                    │
//!                                                  IndexStore (keyed by folder+model)◄┘
//!
//! question ──embed──► top-k ──ContextWindow──► QA prompt ──complete──► Answer
//! ```
//!
//! An index is built once per (folder, model) pair and reused until it is
//! invalidated; there is no change detection. Builds of the same key are
//! serialized in-process by a per-key mutex and across processes by a
//! marker file, and an index is only made visible once fully embedded.

pub mod chat;
pub mod chunk;
pub mod context;
pub mod engine;
pub mod index;
pub mod lock;
pub mod source;
pub mod store;

pub use chat::{ChatSession, QueryEngine};
pub use chunk::{Chunk, chunk_text};
pub use context::{ContextItem, ContextWindow};
pub use engine::{Answer, AnswerSource, IndexOrigin, RetrievalIndex};
pub use index::{IndexEntry, IndexMeta, ScoredChunk, VectorIndex, cosine_similarity};
pub use source::{DocumentFilter, ExtensionFilter, SourceDocument};
pub use store::{IndexKey, IndexStore, StoreError};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use repodoc_config::AppConfig;

use crate::llm::{LlmError, RetryPolicy};
use lock::MarkerError;

/// Errors surfaced to the user of the retrieval index.
#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("invalid retrieval request: {0}")]
    Validation(String),

    #[error("no indexable documents under {}", .0.display())]
    NoDocuments(PathBuf),

    #[error("model provider failed after retries: {0}")]
    Provider(LlmError),

    #[error("fatal model error: {0}")]
    Fatal(LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("timed out waiting for another build of {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("embedding task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RetrievalError {
    /// Classify a model error that survived the retry policy.
    pub fn from_llm(err: LlmError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err)
        } else {
            Self::Provider(err)
        }
    }
}

impl From<MarkerError> for RetrievalError {
    fn from(err: MarkerError) -> Self {
        match err {
            MarkerError::Timeout { path, .. } => Self::LockTimeout(path),
            MarkerError::Io(io) => Self::Store(StoreError::Io(io)),
        }
    }
}

/// How indexes are built and queried.
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub context_budget_chars: usize,
    pub embed_batch_size: usize,
    pub embed_concurrency: usize,
    /// Longest wait for a build held by another process.
    pub build_wait_timeout: Duration,
    pub retry: RetryPolicy,
    pub filter: Arc<dyn DocumentFilter>,
}

impl RetrievalSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let r = &config.retrieval;
        Self {
            chunk_size: r.chunk_size,
            chunk_overlap: r.chunk_overlap,
            top_k: r.top_k,
            context_budget_chars: r.context_budget_chars,
            embed_batch_size: r.embed_batch_size,
            embed_concurrency: r.embed_concurrency,
            build_wait_timeout: Duration::from_secs(r.build_wait_timeout_secs),
            retry: RetryPolicy::from(&config.retry),
            filter: Arc::new(ExtensionFilter::from_config(r)),
        }
    }

    pub fn validate(&self) -> Result<(), RetrievalError> {
        if self.chunk_size == 0 {
            return Err(RetrievalError::Validation("chunk_size must be positive".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RetrievalError::Validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 || self.embed_batch_size == 0 || self.embed_concurrency == 0 {
            return Err(RetrievalError::Validation(
                "top_k, embed_batch_size and embed_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}
