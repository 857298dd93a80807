//! Anthropic Messages API client.

use async_trait::async_trait;
use serde::Deserialize;

use super::{ContentBlock, FinishReason, LlmProvider, Message, ModelRequest, ModelResponse, Role, Usage};
use crate::config::LlmSection;
use crate::errors::LlmError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    content: Vec<ApiBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Unsupported,
}

impl AnthropicProvider {
    pub fn new(config: &LlmSection, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            endpoint: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
        }
    }

    /// Read the API key from the configured environment variable.
    pub fn from_env(config: &LlmSection) -> anyhow::Result<Self> {
        let key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!(
                "{} is not set; export it or change llm.api_key_env",
                config.api_key_env
            )
        })?;
        Ok(Self::new(config, key))
    }

    fn build_body(&self, request: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": request.system,
            "messages": request.messages.iter().map(message_to_wire).collect::<Vec<_>>(),
        });
        if !request.tools.is_empty() {
            body["tools"] = serde_json::json!(
                request
                    .tools
                    .iter()
                    .map(|t| serde_json::json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.input_schema,
                    }))
                    .collect::<Vec<_>>()
            );
        }
        body
    }
}

fn message_to_wire(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    let content: Vec<serde_json::Value> = message
        .content
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => serde_json::json!({"type": "text", "text": text}),
            ContentBlock::ToolUse { id, name, input } => serde_json::json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut result = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                });
                if *is_error {
                    result["is_error"] = serde_json::json!(true);
                }
                result
            }
        })
        .collect();
    serde_json::json!({"role": role, "content": content})
}

fn http_error(status: u16, body: String) -> LlmError {
    match status {
        401 | 403 => LlmError::Authentication(body),
        429 => LlmError::RateLimited(body),
        _ => LlmError::Http { status, body },
    }
}

fn parse_response(raw: ApiResponse) -> Result<ModelResponse, LlmError> {
    let mut content = Vec::with_capacity(raw.content.len());
    for block in raw.content {
        match block {
            ApiBlock::Text { text } => content.push(ContentBlock::Text { text }),
            ApiBlock::ToolUse { id, name, input } => {
                if !input.is_object() {
                    return Err(LlmError::Malformed {
                        tool: name,
                        message: "tool input is not a JSON object".to_string(),
                    });
                }
                content.push(ContentBlock::ToolUse { id, name, input });
            }
            ApiBlock::Unsupported => {}
        }
    }
    Ok(ModelResponse {
        content,
        finish_reason: raw
            .stop_reason
            .as_deref()
            .map(FinishReason::from)
            .unwrap_or(FinishReason::EndTurn),
        usage: raw.usage,
    })
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse, LlmError> {
        let body = self.build_body(request);
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let text = response.text().await?;
        if status != 200 {
            return Err(http_error(status, text));
        }
        let raw: ApiResponse = serde_json::from_str(&text)
            .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, text)))?;
        parse_response(raw)
    }
}
