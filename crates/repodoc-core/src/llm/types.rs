//! Provider-neutral conversation and completion types.
//!
//! These types define the shared vocabulary for chat completions, tool
//! definitions, embeddings and the final-answer signal across all providers.

use serde::{Deserialize, Serialize};

/// Name of the reserved function a model calls to finish a documentation run.
///
/// It is advertised next to the regular tools but never dispatched as one:
/// adapters decode it into [`ChatResponse::final_answer`].
pub const FINAL_ANSWER_TOOL: &str = "submit_documentation";

/// One turn of a conversation, in whichever role produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// One of `system`, `user`, `assistant`, `tool`.
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Set on `tool` turns: the call this turn answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    fn text(role: &str, content: String) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content.into())
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content.into())
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content.into())
    }

    /// An assistant turn that requested tool calls.
    pub fn assistant_tool_calls(content: Option<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            content,
            tool_calls: Some(calls),
            ..Self::text("assistant", String::new())
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::text("tool", content.into())
        }
    }
}

/// Name, description and argument schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (e.g. "search_code", "read_file").
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the arguments.
    pub parameters: serde_json::Value,
}

/// An invocation the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Echoed back on the matching `tool` turn.
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One section as submitted with the final answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionDraft {
    pub title: String,
    pub content: String,
}

/// The structured completion signal of a documentation run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FinalAnswer {
    /// Sections written together with the signal, appended after any
    /// sections already produced through `write_section`.
    #[serde(default)]
    pub sections: Vec<SectionDraft>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Definition of the reserved final-answer function.
pub fn final_answer_definition() -> ToolDefinition {
    ToolDefinition {
        name: FINAL_ANSWER_TOOL.to_string(),
        description: "Finish the task. Call this exactly once when the documentation is \
                      complete. Sections listed here are appended after the ones already \
                      written with write_section."
            .to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "sections": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": {"type": "string"},
                            "content": {"type": "string", "description": "Markdown body"}
                        },
                        "required": ["title", "content"]
                    }
                },
                "summary": {"type": "string"}
            }
        }),
    }
}

/// Pull a well-formed final-answer call out of a provider's tool calls.
///
/// A final-answer call whose arguments do not decode stays in the returned
/// tool calls; dispatch reports it back to the model as invalid arguments.
pub(crate) fn split_final_answer(calls: Vec<ToolCall>) -> (Vec<ToolCall>, Option<FinalAnswer>) {
    let mut rest = Vec::with_capacity(calls.len());
    let mut answer = None;
    for call in calls {
        if call.name == FINAL_ANSWER_TOOL && answer.is_none() {
            match serde_json::from_value::<FinalAnswer>(call.arguments.clone()) {
                Ok(parsed) => {
                    answer = Some(parsed);
                    continue;
                }
                Err(_) => rest.push(call),
            }
        } else {
            rest.push(call);
        }
    }
    (rest, answer)
}

/// One model call: the transcript so far plus the tools on offer.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Upstream model name (e.g. "claude-3-haiku-20240307", "gpt-4o-mini").
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Completion budget.
    pub max_tokens: u32,
    pub temperature: f32,
    /// Takes precedence over `system` turns in `messages`.
    pub system: Option<String>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            model: String::new(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: 4096,
            temperature: 0.0,
            system: None,
        }
    }
}

/// What a model call produced.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The assistant's response message, without the final-answer call.
    pub message: ChatMessage,
    /// Decoded final-answer signal, if the model sent one.
    pub final_answer: Option<FinalAnswer>,
    /// Normalized stop reason (`stop`, `tool_use`, `length`, ...).
    pub finish_reason: String,
    pub usage: TokenUsage,
    /// Model name as reported upstream.
    pub model: String,
}

/// Tokens billed for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Request for a batch of embeddings.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Upstream embedding model name.
    pub model: String,
    pub texts: Vec<String>,
}

/// A completion normalized by the [`ModelHub`](super::ModelHub),
/// independent of the provider that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    /// Model id from the catalog, not the upstream name.
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<FinalAnswer>,
    pub usage: TokenUsage,
}

impl ModelReply {
    pub(crate) fn from_response(model: &str, response: ChatResponse) -> Self {
        Self {
            model: model.to_string(),
            content: response.message.content.filter(|c| !c.trim().is_empty()),
            tool_calls: response.message.tool_calls.unwrap_or_default(),
            final_answer: response.final_answer,
            usage: response.usage,
        }
    }

    /// Rebuild the provider response this reply was normalized from.
    pub fn to_response(&self) -> ChatResponse {
        ChatResponse {
            message: ChatMessage {
                role: "assistant".to_string(),
                content: self.content.clone(),
                tool_call_id: None,
                tool_calls: if self.tool_calls.is_empty() {
                    None
                } else {
                    Some(self.tool_calls.clone())
                },
            },
            final_answer: self.final_answer.clone(),
            finish_reason: "replay".to_string(),
            usage: self.usage,
            model: self.model.clone(),
        }
    }
}
