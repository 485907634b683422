//! A provider that replays canned responses.
//!
//! Used to replay a recorded run from its ledger, and as the model stub in
//! tests. Requests are recorded so callers can inspect what was sent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::BoxFuture;

use super::provider::{LlmError, LlmProvider};
use super::types::{ChatRequest, ChatResponse, EmbedRequest, ModelReply};

/// One scripted outcome of a `chat` call.
#[derive(Debug)]
pub enum ScriptStep {
    Reply(ChatResponse),
    Fail(LlmError),
    /// Hold the call open for the duration, then answer with the inner step.
    Delayed(Duration, Box<ScriptStep>),
}

/// Provider answering `chat` calls from a fixed queue.
///
/// Once the queue is drained every further call fails with
/// [`LlmError::Request`].
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<ScriptStep>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Build a script from normalized replies, e.g. those recorded in a ledger.
    pub fn from_replies<'a>(replies: impl IntoIterator<Item = &'a ModelReply>) -> Self {
        Self::new(
            replies
                .into_iter()
                .map(|r| ScriptStep::Reply(r.to_response())),
        )
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Scripted steps not consumed yet.
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn next_step(&self, request: &ChatRequest) -> (Duration, Result<ChatResponse, LlmError>) {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let mut step = match self.steps.lock() {
            Ok(mut steps) => steps.pop_front(),
            Err(_) => {
                let err = LlmError::Request("script lock poisoned".to_string());
                return (Duration::ZERO, Err(err));
            }
        };
        let mut delay = Duration::ZERO;
        while let Some(ScriptStep::Delayed(wait, inner)) = step {
            delay += wait;
            step = Some(*inner);
        }
        let result = match step {
            Some(ScriptStep::Reply(response)) => Ok(response),
            Some(ScriptStep::Fail(err)) => Err(err),
            Some(ScriptStep::Delayed(..)) | None => {
                Err(LlmError::Request("script exhausted".to_string()))
            }
        };
        (delay, result)
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "Scripted"
    }

    fn chat(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ChatResponse, LlmError>> {
        let (delay, result) = self.next_step(request);
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn embed(&self, request: &EmbedRequest) -> BoxFuture<'_, Result<Vec<Vec<f32>>, LlmError>> {
        let model = request.model.clone();
        Box::pin(async move {
            Err(LlmError::Unsupported(format!(
                "scripted provider cannot embed ({model})"
            )))
        })
    }
}
