//! Per-run values: the run context, the conversation and cancellation.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use crate::llm::ChatMessage;
use crate::tools::Snapshot;

use super::{AgentState, RunError};

/// Everything one documentation run needs to know about itself.
///
/// Owned by the orchestrator for the lifetime of the run; nothing in it is
/// shared with other runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub task_id: String,
    pub snapshot: Snapshot,
    /// Run directory receiving the ledger, log and sections. Must exist.
    pub output_dir: PathBuf,
    /// Model id from the catalog.
    pub model: String,
    pub max_steps: u32,
    /// Consecutive failed tool calls or malformed replies tolerated.
    pub max_consecutive_failures: u32,
    step: u32,
    state: AgentState,
}

impl RunContext {
    pub fn new(
        task_id: impl Into<String>,
        snapshot: Snapshot,
        output_dir: impl Into<PathBuf>,
        model: impl Into<String>,
        max_steps: u32,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            snapshot,
            output_dir: output_dir.into(),
            model: model.into(),
            max_steps,
            max_consecutive_failures: 3,
            step: 0,
            state: AgentState::Init,
        }
    }

    pub fn with_failure_cap(mut self, max_consecutive_failures: u32) -> Self {
        self.max_consecutive_failures = max_consecutive_failures;
        self
    }

    /// Model turns taken so far. Never exceeds `max_steps`.
    pub fn step(&self) -> u32 {
        self.step
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    /// Count one model turn, refusing to pass the cap.
    pub(crate) fn advance_step(&mut self) -> bool {
        if self.step >= self.max_steps {
            return false;
        }
        self.step += 1;
        true
    }

    /// Check the context before anything is written.
    pub fn validate(&self) -> Result<(), RunError> {
        self.validate_settings()?;
        if !self.output_dir.is_dir() {
            return Err(RunError::Validation(format!(
                "output directory {} does not exist",
                self.output_dir.display()
            )));
        }
        Ok(())
    }

    /// Everything [`validate`](Self::validate) checks except the output
    /// directory, which may not exist yet.
    pub fn validate_settings(&self) -> Result<(), RunError> {
        let id = self.task_id.trim();
        if id.is_empty() {
            return Err(RunError::Validation("task id must not be empty".to_string()));
        }
        if id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(RunError::Validation(format!(
                "task id {id:?} must not contain path separators"
            )));
        }
        if self.model.trim().is_empty() {
            return Err(RunError::Validation("model must not be empty".to_string()));
        }
        if self.max_steps == 0 {
            return Err(RunError::Validation("max_steps must be at least 1".to_string()));
        }
        if self.max_consecutive_failures == 0 {
            return Err(RunError::Validation(
                "max_consecutive_failures must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// The conversation with the model. Append-only.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Cooperative cancellation shared between a run and whoever may stop it.
///
/// Cancelling stops new model and tool calls; a ledger write already in
/// progress is allowed to finish.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token, so this only
        // returns once the flag is set.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(dir: &TempDir, task_id: &str) -> RunContext {
        let snapshot = Snapshot::new(dir.path(), None).unwrap();
        RunContext::new(task_id, snapshot, dir.path(), "m", 3)
    }

    #[test]
    fn test_validate_accepts_good_context() {
        let tmp = TempDir::new().unwrap();
        assert!(context(&tmp, "task-1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_task_ids() {
        let tmp = TempDir::new().unwrap();
        for id in ["", "  ", "../x", "a/b", ".."] {
            assert!(
                matches!(context(&tmp, id).validate(), Err(RunError::Validation(_))),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_rejects_missing_output_dir() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(&tmp, "t");
        ctx.output_dir = tmp.path().join("missing");
        assert!(ctx.validate().is_err());
        assert!(ctx.validate_settings().is_ok());

        ctx.max_steps = 0;
        assert!(matches!(ctx.validate_settings(), Err(RunError::Validation(_))));
    }

    #[test]
    fn test_step_counter_is_capped() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(&tmp, "t");
        assert!(ctx.advance_step());
        assert!(ctx.advance_step());
        assert!(ctx.advance_step());
        assert!(!ctx.advance_step());
        assert_eq!(ctx.step(), 3);
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        assert!(!token.is_cancelled());
        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }
}
