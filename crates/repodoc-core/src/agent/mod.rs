//! Documentation agent: the bounded tool-calling loop.
//!
//! A run drives one model through `observe → act` turns against a read-only
//! repository snapshot until it submits its final answer or a bound is hit.
//!
//! ```text
//!            ┌──────────── malformed reply ─────────────┐
//!            ▼                                          │
//! Init → Planning ──tool call──► ToolDispatch ──► Observing
//!            │                                     (ledger first,
//!            │ final answer                         then conversation)
//!            ▼
//!       Completing → Done            any state ──► Failed
//! ```
//!
//! Every model reply and tool result is written to the [`Ledger`](crate::ledger::Ledger)
//! before the loop looks at it again. Whatever the outcome, the sections
//! written so far are persisted to the run directory.

pub mod artifact;
pub mod context;
pub mod orchestrator;
pub mod prompt;
pub mod replay;
pub mod state;

pub use artifact::DocumentationArtifact;
pub use context::{CancelToken, Conversation, RunContext};
pub use orchestrator::DocAgent;
pub use replay::{RecordedRun, ReplayError, RunMeta, replay_run};
pub use state::AgentState;

use repodoc_config::AppConfig;

use crate::ledger::LedgerError;
use crate::llm::{LlmError, RetryPolicy};
use crate::tools::{ToolError, ToolLimits};

/// A bound the run ran into.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CapacityKind {
    #[error("step limit of {max} model turns reached without a final answer")]
    StepLimit { max: u32 },

    #[error("{0}")]
    Sections(ToolError),
}

/// Why a documentation run stopped without completing.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid run: {0}")]
    Validation(String),

    #[error("capacity exceeded: {0}")]
    Capacity(CapacityKind),

    #[error("model provider failed after retries: {0}")]
    Provider(LlmError),

    #[error("fatal model error: {0}")]
    Fatal(LlmError),

    #[error("{count} consecutive failed steps")]
    TooManyFailures { count: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("run I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Classify a model error that survived the retry policy.
    pub fn from_llm(err: LlmError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err)
        } else {
            Self::Provider(err)
        }
    }
}

/// A failed run together with the partial artifact it left behind.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: RunError,
    pub artifact: DocumentationArtifact,
}

/// Knobs of the agent that do not vary between runs.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub limits: ToolLimits,
    pub max_sections: usize,
    pub max_section_bytes: usize,
    pub result_summary_chars: usize,
    pub retry: RetryPolicy,
    /// Write `conversation_round_<n>.json` after each step.
    pub conversation_snapshots: bool,
}

impl AgentSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            limits: ToolLimits::from(&config.tools),
            max_sections: config.agent.max_sections,
            max_section_bytes: config.agent.max_section_bytes,
            result_summary_chars: config.tools.result_summary_chars,
            retry: RetryPolicy::from(&config.retry),
            conversation_snapshots: true,
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_llm_errors_are_classified() {
        assert!(matches!(
            RunError::from_llm(LlmError::Auth("bad key".into())),
            RunError::Fatal(_)
        ));
        assert!(matches!(
            RunError::from_llm(LlmError::UnknownModel("x".into())),
            RunError::Fatal(_)
        ));
        assert!(matches!(
            RunError::from_llm(LlmError::Timeout),
            RunError::Provider(_)
        ));
    }

    #[test]
    fn test_settings_follow_config() {
        let mut config = AppConfig::default();
        config.agent.max_sections = 7;
        config.retry.max_attempts = 5;
        let settings = AgentSettings::from_config(&config);
        assert_eq!(settings.max_sections, 7);
        assert_eq!(settings.retry.max_attempts, 5);
    }
}
