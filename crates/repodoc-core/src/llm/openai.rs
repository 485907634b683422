//! Adapter for `/chat/completions` and `/embeddings`.
//!
//! Works against any server speaking the same wire format; point
//! `base_url` at a local gateway to use one.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BoxFuture;

use super::provider::{LlmError, LlmProvider};
use super::types::*;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Chat and embedding provider for the OpenAI wire format.
pub struct OpenAiProvider {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
        }
    }

    /// Replace the API root, e.g. `http://localhost:11434/v1`.
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

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Translate a request into a Chat Completions body. An explicit system
    /// prompt is sent as the first message.
    fn build_request_body(&self, request: &ChatRequest) -> CompletionRequest {
        let system = request.system.as_ref().map(|text| WireMessage {
            role: "system".to_string(),
            content: Some(text.clone()),
            tool_calls: None,
            tool_call_id: None,
        });
        let tools: Vec<WireTool> = request.tools.iter().map(WireTool::from).collect();

        CompletionRequest {
            model: request.model.clone(),
            messages: system
                .into_iter()
                .chain(request.messages.iter().map(WireMessage::from))
                .collect(),
            tools: (!tools.is_empty()).then_some(tools),
            max_tokens: Some(request.max_tokens),
            temperature: Some(request.temperature),
        }
    }

    fn parse_response(&self, resp: CompletionResponse) -> Result<ChatResponse, LlmError> {
        let Some(choice) = resp.choices.into_iter().next() else {
            return Err(LlmError::Parse("no choices in response".to_string()));
        };
        let calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(ToolCall::from)
            .collect();
        let (tool_calls, final_answer) = split_final_answer(calls);

        Ok(ChatResponse {
            message: ChatMessage {
                role: "assistant".to_string(),
                content: choice.message.content,
                tool_call_id: None,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            },
            final_answer,
            finish_reason: finish_reason(choice.finish_reason.as_deref()),
            usage: resp
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
                .unwrap_or_default(),
            model: resp.model,
        })
    }

    /// POST a JSON body and classify the HTTP outcome.
    async fn post<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, LlmError> {
        if self.api_key.is_empty() {
            return Err(LlmError::Auth("no API key configured".to_string()));
        }

        let resp = self
            .client
            .post(self.endpoint(path))
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(body)
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

        resp.json()
            .await
            .map_err(|e| LlmError::Parse(e.to_string()))
    }
}

impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "OpenAI"
    }

    fn chat(&self, request: &ChatRequest) -> BoxFuture<'_, Result<ChatResponse, LlmError>> {
        let body = self.build_request_body(request);
        Box::pin(async move {
            debug!(model = %body.model, messages = body.messages.len(), "OpenAI chat request");
            let api_resp: CompletionResponse = self.post("chat/completions", &body).await?;
            self.parse_response(api_resp)
        })
    }

    fn embed(&self, request: &EmbedRequest) -> BoxFuture<'_, Result<Vec<Vec<f32>>, LlmError>> {
        let body = EmbeddingsRequest {
            model: request.model.clone(),
            input: request.texts.clone(),
        };
        Box::pin(async move {
            debug!(model = %body.model, texts = body.input.len(), "OpenAI embedding request");
            let api_resp: EmbeddingsResponse = self.post("embeddings", &body).await?;
            parse_embeddings(api_resp, body.input.len())
        })
    }
}

/// Order embeddings by their `index` and check one came back per input.
fn parse_embeddings(
    resp: EmbeddingsResponse,
    expected: usize,
) -> Result<Vec<Vec<f32>>, LlmError> {
    let mut data = resp.data;
    data.sort_by_key(|d| d.index);
    if data.len() != expected {
        return Err(LlmError::Parse(format!(
            "expected {expected} embeddings, got {}",
            data.len()
        )));
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

fn finish_reason(reason: Option<&str>) -> String {
    match reason {
        Some("tool_calls") => "tool_use",
        Some(other) => other,
        None => "unknown",
    }
    .to_string()
}

impl From<&ChatMessage> for WireMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role.clone(),
            content: message.content.clone(),
            tool_calls: message
                .tool_calls
                .as_ref()
                .map(|calls| calls.iter().map(WireToolCall::from).collect()),
            tool_call_id: message.tool_call_id.clone(),
        }
    }
}

impl From<&ToolCall> for WireToolCall {
    fn from(call: &ToolCall) -> Self {
        Self {
            id: call.id.clone(),
            r#type: "function".to_string(),
            function: WireFunctionCall {
                name: call.name.clone(),
                arguments: call.arguments.to_string(),
            },
        }
    }
}

impl From<WireToolCall> for ToolCall {
    /// Arguments that are not valid JSON are kept as a string so the
    /// registry can report them back to the model.
    fn from(call: WireToolCall) -> Self {
        let arguments = serde_json::from_str(&call.function.arguments)
            .unwrap_or(serde_json::Value::String(call.function.arguments));
        Self {
            id: call.id,
            name: call.function.name,
            arguments,
        }
    }
}

impl From<&ToolDefinition> for WireTool {
    fn from(tool: &ToolDefinition) -> Self {
        Self {
            r#type: "function".to_string(),
            function: WireFunctionSpec {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        }
    }
}

// Chat Completions and Embeddings wire types.

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    r#type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: String,
    function: WireFunctionSpec,
}

#[derive(Debug, Serialize)]
struct WireFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    model: String,
    choices: Vec<Choice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("sk-unused")
    }

    fn assistant_message(content: Option<&str>, calls: Vec<WireToolCall>) -> WireMessage {
        WireMessage {
            role: "assistant".to_string(),
            content: content.map(str::to_string),
            tool_calls: if calls.is_empty() { None } else { Some(calls) },
            tool_call_id: None,
        }
    }

    fn function_call(id: &str, name: &str, arguments: &str) -> WireToolCall {
        WireToolCall {
            id: id.to_string(),
            r#type: "function".to_string(),
            function: WireFunctionCall {
                name: name.to_string(),
                arguments: arguments.to_string(),
            },
        }
    }

    #[test]
    fn test_system_prompt_leads_the_messages() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("Document this repository.")],
            system: Some("You document codebases.".to_string()),
            max_tokens: 2048,
            ..Default::default()
        };

        let body = provider().build_request_body(&request);
        assert_eq!(body.max_tokens, Some(2048));
        let roles: Vec<&str> = body.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["system", "user"]);
        assert!(body.tools.is_none());
    }

    #[test]
    fn test_build_request_serializes_tool_calls() {
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![
                ChatMessage::assistant_tool_calls(
                    None,
                    vec![ToolCall {
                        id: "call_1".to_string(),
                        name: "read_file".to_string(),
                        arguments: serde_json::json!({"path": "src/main.rs"}),
                    }],
                ),
                ChatMessage::tool_result("call_1", "fn main() {}"),
            ],
            tools: vec![final_answer_definition()],
            ..Default::default()
        };

        let body = provider().build_request_body(&request);
        let calls = body.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.arguments, r#"{"path":"src/main.rs"}"#);
        assert_eq!(body.messages[1].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(body.tools.as_ref().unwrap()[0].function.name, FINAL_ANSWER_TOOL);
    }

    #[test]
    fn test_parse_text_response() {
        let api_resp = CompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![Choice {
                message: assistant_message(Some("See src/lib.rs."), vec![]),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(WireUsage {
                prompt_tokens: 5,
                completion_tokens: 3,
            }),
        };

        let resp = provider().parse_response(api_resp).unwrap();
        assert_eq!(resp.message.content.as_deref(), Some("See src/lib.rs."));
        assert_eq!(resp.finish_reason, "stop");
        assert_eq!(resp.usage.total_tokens, 8);
        assert!(resp.final_answer.is_none());
    }

    #[test]
    fn test_parse_final_answer_call() {
        let api_resp = CompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![Choice {
                message: assistant_message(
                    None,
                    vec![function_call(
                        "call_9",
                        FINAL_ANSWER_TOOL,
                        r#"{"sections":[{"title":"Overview","content":"A CLI."}]}"#,
                    )],
                ),
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };

        let resp = provider().parse_response(api_resp).unwrap();
        assert!(resp.message.tool_calls.is_none());
        let answer = resp.final_answer.unwrap();
        assert_eq!(answer.sections[0].title, "Overview");
        assert_eq!(resp.finish_reason, "tool_use");
    }

    #[test]
    fn test_parse_keeps_malformed_arguments_as_string() {
        let api_resp = CompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![Choice {
                message: assistant_message(None, vec![function_call("c", "read_file", "{oops")]),
                finish_reason: Some("tool_calls".to_string()),
            }],
            usage: None,
        };

        let resp = provider().parse_response(api_resp).unwrap();
        let calls = resp.message.tool_calls.unwrap();
        assert_eq!(calls[0].arguments, serde_json::Value::String("{oops".into()));
    }

    #[test]
    fn test_parse_empty_choices_is_error() {
        let api_resp = CompletionResponse {
            model: "gpt-4o-mini".to_string(),
            choices: vec![],
            usage: None,
        };
        assert!(matches!(
            provider().parse_response(api_resp),
            Err(LlmError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_embeddings_orders_by_index() {
        let resp = EmbeddingsResponse {
            data: vec![
                EmbeddingItem {
                    index: 1,
                    embedding: vec![0.0, 1.0],
                },
                EmbeddingItem {
                    index: 0,
                    embedding: vec![1.0, 0.0],
                },
            ],
        };
        let vectors = parse_embeddings(resp, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_embeddings_count_mismatch() {
        let resp = EmbeddingsResponse { data: vec![] };
        assert!(parse_embeddings(resp, 1).is_err());
    }

    #[test]
    fn test_custom_base_url() {
        let provider = OpenAiProvider::new("key").with_base_url("http://localhost:11434/v1/");
        assert_eq!(
            provider.endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_auth_error() {
        let provider = OpenAiProvider::new("");
        let request = ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![ChatMessage::user("hi")],
            ..Default::default()
        };
        let err = provider.chat(&request).await.unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
    }
}
