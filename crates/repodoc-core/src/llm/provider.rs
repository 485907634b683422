//! LLM provider trait: the network boundary for completions and embeddings.
//!
//! Every backend (Anthropic, OpenAI-compatible, scripted) implements this
//! trait. The [`ModelHub`](super::ModelHub) dispatches through it.

use crate::BoxFuture;

use super::types::{ChatRequest, ChatResponse, EmbedRequest};

/// Errors from LLM provider calls.
///
/// Providers only classify failures. Whether to retry is decided by the
/// caller through [`is_retryable`](Self::is_retryable).
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {0}")]
    Request(String),

    #[error("authentication failed (check API key): {0}")]
    Auth(String),

    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("unknown model id: {0}")]
    UnknownModel(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("context length exceeded: {0}")]
    ContextLength(String),

    #[error("response parse error: {0}")]
    Parse(String),

    #[error("provider error: {status}: {message}")]
    ProviderError { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout")]
    Timeout,

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl LlmError {
    /// Errors that must abort immediately without a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::UnknownModel(_) | Self::ModelNotFound(_) | Self::Unsupported(_)
        )
    }

    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout => true,
            Self::ProviderError { status, .. } => *status == 0 || *status >= 500,
            _ => false,
        }
    }

    /// Short machine-readable name used in ledger records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Auth(_) => "auth",
            Self::RateLimited { .. } => "rate_limited",
            Self::UnknownModel(_) => "unknown_model",
            Self::ModelNotFound(_) => "model_not_found",
            Self::ContextLength(_) => "context_length",
            Self::Parse(_) => "parse",
            Self::ProviderError { .. } => "provider_error",
            Self::Network(_) => "network",
            Self::Timeout => "timeout",
            Self::Unsupported(_) => "unsupported",
        }
    }

    /// Classify a `reqwest` transport failure.
    pub(crate) fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub(crate) fn from_status(status: u16, retry_after: Option<u64>, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            404 => Self::ModelNotFound(body),
            429 => Self::RateLimited {
                retry_after_secs: retry_after.unwrap_or(60),
            },
            _ => Self::ProviderError {
                status,
                message: body,
            },
        }
    }
}

/// Core trait for LLM providers.
///
/// Implementations must be `Send + Sync` and hold no per-call mutable state,
/// so one provider can serve concurrent runs. Uses `BoxFuture` for object
/// safety (allows `Arc<dyn LlmProvider>`).
pub trait LlmProvider: Send + Sync {
    /// Provider display name (e.g. "Anthropic", "OpenAI").
    fn name(&self) -> &str;

    /// Perform a chat completion.
    fn chat(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ChatResponse, LlmError>>;

    /// Embed a batch of texts, one vector per input, in input order.
    fn embed(&self, request: &EmbedRequest) -> BoxFuture<'_, Result<Vec<Vec<f32>>, LlmError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(LlmError::Auth("bad key".into()).is_fatal());
        assert!(LlmError::UnknownModel("x".into()).is_fatal());
        assert!(!LlmError::Timeout.is_fatal());
        assert!(!LlmError::RateLimited { retry_after_secs: 1 }.is_fatal());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(LlmError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(LlmError::Timeout.is_retryable());
        assert!(LlmError::Network("reset".into()).is_retryable());
        assert!(
            LlmError::ProviderError {
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !LlmError::ProviderError {
                status: 400,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!LlmError::Auth("no".into()).is_retryable());
        assert!(!LlmError::Parse("junk".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            LlmError::from_status(401, None, String::new()),
            LlmError::Auth(_)
        ));
        assert!(matches!(
            LlmError::from_status(429, Some(7), String::new()),
            LlmError::RateLimited { retry_after_secs: 7 }
        ));
        assert!(matches!(
            LlmError::from_status(404, None, String::new()),
            LlmError::ModelNotFound(_)
        ));
        assert!(matches!(
            LlmError::from_status(502, None, String::new()),
            LlmError::ProviderError { status: 502, .. }
        ));
    }
}
