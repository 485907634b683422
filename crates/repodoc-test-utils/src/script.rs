//! Builders for scripted model replies.
//!
//! ```ignore
//! let provider = ScriptedProvider::new([
//!     call("1", "list_files", json!({"path": "."})),
//!     finish(&[("Overview", "A small crate.")]),
//! ]);
//! ```

use repodoc_core::llm::{
    ChatMessage, ChatResponse, FinalAnswer, ScriptStep, SectionDraft, TokenUsage, ToolCall,
};
use serde_json::Value;

/// Usage reported by every scripted reply.
pub const USAGE: TokenUsage = TokenUsage {
    prompt_tokens: 100,
    completion_tokens: 20,
    total_tokens: 120,
};

fn response(message: ChatMessage, final_answer: Option<FinalAnswer>) -> ScriptStep {
    ScriptStep::Reply(ChatResponse {
        message,
        final_answer,
        finish_reason: "stop".to_string(),
        usage: USAGE,
        model: "scripted".to_string(),
    })
}

/// A reply requesting one tool call.
pub fn call(id: &str, tool: &str, arguments: Value) -> ScriptStep {
    calls(vec![(id, tool, arguments)])
}

/// A reply requesting several tool calls at once.
pub fn calls(requested: Vec<(&str, &str, Value)>) -> ScriptStep {
    let calls = requested
        .into_iter()
        .map(|(id, name, arguments)| ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        })
        .collect();
    response(ChatMessage::assistant_tool_calls(None, calls), None)
}

/// A final answer carrying `sections` as (title, content) pairs.
pub fn finish(sections: &[(&str, &str)]) -> ScriptStep {
    let sections = sections
        .iter()
        .map(|(title, content)| SectionDraft {
            title: title.to_string(),
            content: content.to_string(),
        })
        .collect();
    response(
        ChatMessage::assistant_tool_calls(None, Vec::new()),
        Some(FinalAnswer {
            sections,
            summary: None,
        }),
    )
}

/// A plain-text reply with neither tool calls nor a final answer.
pub fn text(content: &str) -> ScriptStep {
    response(ChatMessage::assistant(content), None)
}
