//! Messages-API client for Anthropic models.
//!
//! Structured output is requested by forcing a single tool whose input schema
//! is the desired shape; its input comes back as the response content.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::token_limits::anthropic_marker;
use super::{ChatModel, ModelRequest, ModelResponse, NativeSearch, transport_error};
use crate::error::ModelError;
use crate::message::{Message, ToolCall};
use crate::security::SecretValue;

const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretValue,
}

impl AnthropicChatModel {
    pub fn new(client: reqwest::Client, base_url: String, api_key: SecretValue) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl ChatModel for AnthropicChatModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .header("x-api-key", self.api_key.expose())
            .header("anthropic-version", API_VERSION)
            .json(&payload(&request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 400 && anthropic_marker(&body.to_ascii_lowercase()) {
                return Err(ModelError::token_limit(&request.model, body));
            }
            return Err(ModelError::Http {
                status: status.as_u16(),
                message: body,
            });
        }

        let value: Value = response.json().await.map_err(transport_error)?;
        Ok(parse_response(
            &value,
            request.structured_output.as_ref().map(|s| s.name),
        ))
    }
}

fn payload(request: &ModelRequest) -> Value {
    let system = request
        .messages
        .iter()
        .filter_map(|message| match message {
            Message::System { content } => Some(content.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n\n");

    let mut body = Map::new();
    body.insert("model".into(), json!(request.model));
    body.insert("max_tokens".into(), json!(request.max_tokens));
    if !system.is_empty() {
        body.insert("system".into(), json!(system));
    }
    body.insert("messages".into(), Value::Array(wire_messages(&request.messages)));

    let mut tools: Vec<Value> = request
        .tools
        .iter()
        .map(|spec| {
            json!({
                "name": spec.name,
                "description": spec.description,
                "input_schema": spec.parameters,
            })
        })
        .collect();
    if request.native_search == Some(NativeSearch::Anthropic) {
        tools.push(json!({"type": "web_search_20250305", "name": "web_search", "max_uses": 5}));
    }
    if let Some(schema) = &request.structured_output {
        tools.push(json!({
            "name": schema.name,
            "description": "Respond with structured output matching this schema.",
            "input_schema": schema.schema,
        }));
        body.insert("tool_choice".into(), json!({"type": "tool", "name": schema.name}));
    }
    if !tools.is_empty() {
        body.insert("tools".into(), Value::Array(tools));
    }

    Value::Object(body)
}

/// Convert to alternating user/assistant turns; adjacent same-role turns
/// (typically a batch of tool results) are merged into one.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut turns: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for message in messages {
        let (role, blocks) = match message {
            Message::System { .. } => continue,
            Message::Human { content } => ("user", vec![json!({"type": "text", "text": content})]),
            Message::Ai {
                content,
                tool_calls,
                ..
            } => {
                let mut blocks = Vec::new();
                if !content.trim().is_empty() {
                    blocks.push(json!({"type": "text", "text": content}));
                }
                blocks.extend(tool_calls.iter().map(|call| {
                    json!({"type": "tool_use", "id": call.id, "name": call.name, "input": call.args})
                }));
                ("assistant", blocks)
            }
            Message::Tool {
                content,
                tool_call_id,
                ..
            } => (
                "user",
                vec![json!({"type": "tool_result", "tool_use_id": tool_call_id, "content": content})],
            ),
        };
        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some((last_role, last_blocks)) if *last_role == role => last_blocks.extend(blocks),
            _ => turns.push((role, blocks)),
        }
    }

    turns
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn parse_response(value: &Value, structured_tool: Option<&str>) -> ModelResponse {
    let mut response = ModelResponse::default();
    let blocks = value
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    response.content.push_str(text);
                }
            }
            Some("tool_use") => {
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                if Some(name) == structured_tool {
                    response.content = input.to_string();
                    continue;
                }
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                response.tool_calls.push(ToolCall::new(id, name, input));
            }
            Some("server_tool_use") | Some("web_search_tool_result") => {
                response.native_search_used = true;
            }
            _ => {}
        }
    }
    response
}
