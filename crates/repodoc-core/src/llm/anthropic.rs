//! Adapter for the Anthropic Messages API (`/v1/messages`).
//!
//! Tool calls and tool results travel as typed content blocks. There is no
//! embeddings endpoint, so [`LlmProvider::embed`] fails with
//! [`LlmError::Unsupported`].

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BoxFuture;

use super::provider::{LlmError, LlmProvider};
use super::types::*;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Chat-only provider backed by Claude models.
pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_BASE.to_string(),
        }
    }

    /// Set a custom base URL (proxies, gateways).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Bound every request by `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        self
    }

    /// Translate a request into a Messages API body. System messages move
    /// to the top-level `system` field.
    fn build_request_body(&self, request: &ChatRequest) -> MessagesRequest {
        let system = request.system.clone().or_else(|| {
            let joined: Vec<&str> = request
                .messages
                .iter()
                .filter(|m| m.role == "system")
                .filter_map(|m| m.content.as_deref())
                .collect();
            (!joined.is_empty()).then(|| joined.join("\n\n"))
        });
        let tools: Vec<WireTool> = request.tools.iter().map(WireTool::from).collect();

        MessagesRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            system,
            messages: request
                .messages
                .iter()
                .filter(|m| m.role != "system")
                .map(to_wire)
                .collect(),
            tools: (!tools.is_empty()).then_some(tools),
            temperature: Some(request.temperature),
        }
    }

    fn parse_response(&self, resp: MessagesResponse) -> ChatResponse {
        let mut texts = Vec::new();
        let mut calls = Vec::new();
        for block in resp.content {
            match block {
                ContentBlock::Text { text } => texts.push(text),
                ContentBlock::ToolUse { id, name, input } => calls.push(ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ContentBlock::ToolResult { .. } => {}
            }
        }
        let (tool_calls, final_answer) = split_final_answer(calls);

        ChatResponse {
            message: ChatMessage {
                role: "assistant".to_string(),
                content: (!texts.is_empty()).then(|| texts.join("\n")),
                tool_call_id: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            final_answer,
            finish_reason: finish_reason(resp.stop_reason.as_deref()),
            usage: TokenUsage::new(resp.usage.input_tokens, resp.usage.output_tokens),
            model: resp.model,
        }
    }
}

/// Tool results travel as `user` turns holding a `tool_result` block;
/// assistant tool calls as `tool_use` blocks after any text.
fn to_wire(message: &ChatMessage) -> WireMessage {
    if message.role == "tool" {
        return WireMessage {
            role: "user".to_string(),
            content: WireContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
                content: message.content.clone().unwrap_or_default(),
            }]),
        };
    }
    let Some(calls) = &message.tool_calls else {
        return WireMessage {
            role: message.role.clone(),
            content: WireContent::Text(message.content.clone().unwrap_or_default()),
        };
    };
    let text = message
        .content
        .iter()
        .map(|text| ContentBlock::Text { text: text.clone() });
    let uses = calls.iter().map(|call| ContentBlock::ToolUse {
        id: call.id.clone(),
        name: call.name.clone(),
        input: call.arguments.clone(),
    });
    WireMessage {
        role: message.role.clone(),
        content: WireContent::Blocks(text.chain(uses).collect()),
    }
}

fn finish_reason(stop_reason: Option<&str>) -> String {
    match stop_reason {
        Some("end_turn") => "stop",
        Some("max_tokens") => "length",
        Some(other) => other,
        None => "unknown",
    }
    .to_string()
}

impl From<&ToolDefinition> for WireTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.parameters.clone(),
        }
    }
}

impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "Anthropic"
    }

    fn chat(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ChatResponse, LlmError>> {
        let body = self.build_request_body(request);
        Box::pin(async move {
            debug!(model = %body.model, messages = body.messages.len(), "Anthropic chat request");
            if self.api_key.is_empty() {
                return Err(LlmError::Auth("no API key configured".to_string()));
            }

            let resp = self
                .client
                .post(format!("{}/v1/messages", self.base_url))
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_API_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(LlmError::from_transport)?;

            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let retry_after = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse().ok());
                let error_body = resp.text().await.unwrap_or_default();
                return Err(LlmError::from_status(status, retry_after, error_body));
            }

            let api_resp: MessagesResponse = resp
                .json()
                .await
                .map_err(|e| LlmError::Parse(e.to_string()))?;

            Ok(self.parse_response(api_resp))
        })
    }

    fn embed(&self, request: &EmbedRequest) -> BoxFuture<'_, Result<Vec<Vec<f32>>, LlmError>> {
        let model = request.model.clone();
        Box::pin(async move {
            Err(LlmError::Unsupported(format!(
                "Anthropic has no embeddings endpoint (requested {model})"
            )))
        })
    }
}

// Messages API wire types.

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    model: String,
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const MODEL: &str = "claude-sonnet-4-20250514";

    fn reply(content: Vec<ContentBlock>, stop: &str) -> MessagesResponse {
        MessagesResponse {
            model: MODEL.to_string(),
            content,
            stop_reason: Some(stop.to_string()),
            usage: WireUsage {
                input_tokens: 300,
                output_tokens: 45,
            },
        }
    }

    fn provider() -> AnthropicProvider {
        AnthropicProvider::new("sk-ant-unused")
    }

    #[test]
    fn test_system_turns_lift_into_system_field() {
        let request = ChatRequest {
            model: MODEL.to_string(),
            messages: vec![
                ChatMessage::system("You document codebases."),
                ChatMessage::system("Cite file paths."),
                ChatMessage::user("Document this repository."),
            ],
            max_tokens: 4096,
            ..Default::default()
        };

        let body = provider().build_request_body(&request);
        assert_eq!(
            body.system.as_deref(),
            Some("You document codebases.\n\nCite file paths.")
        );
        assert_eq!(body.max_tokens, 4096);
        assert_eq!(body.messages.len(), 1);
        assert!(body.tools.is_none());
    }

    #[test]
    fn test_tool_schema_maps_to_input_schema() {
        let request = ChatRequest {
            model: MODEL.to_string(),
            messages: vec![ChatMessage::user("go")],
            tools: vec![ToolDefinition {
                name: "read_file".to_string(),
                description: "Read one file of the snapshot".to_string(),
                parameters: json!({"type": "object", "properties": {"path": {"type": "string"}}}),
            }],
            ..Default::default()
        };

        let body = serde_json::to_value(provider().build_request_body(&request)).unwrap();
        assert_eq!(body["tools"][0]["name"], "read_file");
        assert_eq!(
            body["tools"][0]["input_schema"]["properties"]["path"]["type"],
            "string"
        );
    }

    #[test]
    fn test_tool_result_becomes_user_block() {
        let request = ChatRequest {
            model: MODEL.to_string(),
            messages: vec![
                ChatMessage::user("go"),
                ChatMessage::assistant_tool_calls(
                    Some("Listing first.".to_string()),
                    vec![ToolCall {
                        id: "toolu_1".to_string(),
                        name: "list_files".to_string(),
                        arguments: json!({"path": "."}),
                    }],
                ),
                ChatMessage::tool_result("toolu_1", "README.md\nsrc/main.rs"),
            ],
            ..Default::default()
        };
        let body = provider().build_request_body(&request);

        let assistant = serde_json::to_value(&body.messages[1].content).unwrap();
        assert_eq!(assistant[0]["type"], "text");
        assert_eq!(assistant[1]["type"], "tool_use");
        assert_eq!(assistant[1]["input"]["path"], ".");

        assert_eq!(body.messages[2].role, "user");
        let result = serde_json::to_value(&body.messages[2].content).unwrap();
        assert_eq!(result[0]["type"], "tool_result");
        assert_eq!(result[0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn test_text_reply_maps_stop_reason_and_usage() {
        let resp = provider().parse_response(reply(
            vec![ContentBlock::Text {
                text: "The crate parses TOML.".to_string(),
            }],
            "end_turn",
        ));
        assert_eq!(resp.message.content.as_deref(), Some("The crate parses TOML."));
        assert_eq!(resp.finish_reason, "stop");
        assert_eq!(resp.usage.total_tokens, 345);
        assert!(resp.final_answer.is_none());
    }

    #[test]
    fn test_tool_use_reply_yields_calls() {
        let resp = provider().parse_response(reply(
            vec![ContentBlock::ToolUse {
                id: "toolu_9".to_string(),
                name: "read_file".to_string(),
                input: json!({"path": "Cargo.toml"}),
            }],
            "tool_use",
        ));
        assert_eq!(resp.finish_reason, "tool_use");
        let calls = resp.message.tool_calls.unwrap_or_default();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "toolu_9");
        assert_eq!(calls[0].arguments["path"], "Cargo.toml");
    }

    #[test]
    fn test_final_answer_block_is_split_out() {
        let resp = provider().parse_response(reply(
            vec![
                ContentBlock::Text {
                    text: "Done.".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "toolu_2".to_string(),
                    name: FINAL_ANSWER_TOOL.to_string(),
                    input: json!({"sections": [], "summary": "nothing to add"}),
                },
            ],
            "tool_use",
        ));
        assert!(resp.message.tool_calls.is_none());
        assert_eq!(
            resp.final_answer.and_then(|a| a.summary).as_deref(),
            Some("nothing to add")
        );
    }

    #[tokio::test]
    async fn test_embed_is_unsupported() {
        let err = provider()
            .embed(&EmbedRequest {
                model: "none".to_string(),
                texts: vec!["x".to_string()],
            })
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }
}
