//! A deterministic in-process model for retrieval tests.
//!
//! [`HashEmbedder`] embeds text as a normalized bag of hashed words, so
//! texts sharing words score higher than texts that do not, and answers chat
//! requests with a fixed reply. It counts embedding calls and can fail a
//! number of them with a transient error.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use repodoc_core::BoxFuture;
use repodoc_core::llm::{
    ChatMessage, ChatRequest, ChatResponse, EmbedRequest, LlmError, LlmProvider, TokenUsage,
};

/// Default embedding width.
pub const DIMS: usize = 64;

#[derive(Debug)]
pub struct HashEmbedder {
    dims: usize,
    reply: String,
    delay: Duration,
    embed_calls: AtomicUsize,
    embedded_texts: AtomicUsize,
    failures_left: AtomicUsize,
    chat_requests: Mutex<Vec<ChatRequest>>,
}

impl HashEmbedder {
    pub fn new() -> Self {
        Self {
            dims: DIMS,
            reply: "stub answer".to_string(),
            delay: Duration::ZERO,
            embed_calls: AtomicUsize::new(0),
            embedded_texts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            chat_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_dims(mut self, dims: usize) -> Self {
        self.dims = dims.max(1);
        self
    }

    /// Text returned by every `chat` call.
    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    /// Sleep this long inside every `embed` call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `n` embedding calls with [`LlmError::Network`].
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Embedding calls received, including failed ones.
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Texts embedded successfully.
    pub fn embedded_texts(&self) -> usize {
        self.embedded_texts.load(Ordering::SeqCst)
    }

    pub fn chat_requests(&self) -> Vec<ChatRequest> {
        self.chat_requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// The vector `text` embeds to.
    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let slot = (fnv1a(&word.to_lowercase()) % self.dims as u64) as usize;
            v[slot] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl LlmProvider for HashEmbedder {
    fn name(&self) -> &str {
        "HashEmbedder"
    }

    fn chat(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ChatResponse, LlmError>> {
        if let Ok(mut requests) = self.chat_requests.lock() {
            requests.push(request.clone());
        }
        let response = ChatResponse {
            message: ChatMessage::assistant(self.reply.clone()),
            final_answer: None,
            finish_reason: "stop".to_string(),
            usage: TokenUsage::new(10, 5),
            model: request.model.clone(),
        };
        Box::pin(async move { Ok(response) })
    }

    fn embed(&self, request: &EmbedRequest) -> BoxFuture<'_, Result<Vec<Vec<f32>>, LlmError>> {
        let texts = request.texts.clone();
        Box::pin(async move {
            self.embed_calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.take_failure() {
                return Err(LlmError::Network("injected failure".to_string()));
            }
            self.embedded_texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| self.vector(t)).collect())
        })
    }
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in s.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
