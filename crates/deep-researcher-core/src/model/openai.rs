//! Chat-completions client for OpenAI and OpenAI-compatible endpoints.

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::token_limits::{google_marker, openai_marker};
use super::{ChatModel, ModelRequest, ModelResponse, NativeSearch, Provider, transport_error};
use crate::error::ModelError;
use crate::message::{Message, ToolCall};
use crate::security::SecretValue;

#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretValue,
    provider: Provider,
}

impl OpenAiChatModel {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: SecretValue,
        provider: Provider,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            provider,
        }
    }

    fn payload(&self, request: &ModelRequest) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "messages".into(),
            Value::Array(request.messages.iter().map(wire_message).collect()),
        );
        let budget_key = match self.provider {
            Provider::OpenAi => "max_completion_tokens",
            _ => "max_tokens",
        };
        body.insert(budget_key.into(), json!(request.max_tokens));

        if !request.tools.is_empty() {
            let tools = request
                .tools
                .iter()
                .map(|spec| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": spec.name,
                            "description": spec.description,
                            "parameters": spec.parameters,
                        }
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(tools));
        }

        if request.native_search == Some(NativeSearch::Openai) {
            body.insert("web_search_options".into(), json!({}));
        }

        if let Some(schema) = &request.structured_output {
            body.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {"name": schema.name, "schema": schema.schema}
                }),
            );
        }

        Value::Object(body)
    }

    fn error_for(&self, model: &str, status: u16, body: String) -> ModelError {
        let lower = body.to_ascii_lowercase();
        let overflow = match self.provider {
            Provider::Google => google_marker(&lower),
            _ => status == 400 && openai_marker(&lower),
        };
        if overflow {
            ModelError::token_limit(model, body)
        } else {
            ModelError::Http {
                status,
                message: body,
            }
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(url)
            .bearer_auth(self.api_key.expose())
            .json(&self.payload(&request))
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.error_for(&request.model, status.as_u16(), body));
        }

        let value: Value = response.json().await.map_err(transport_error)?;
        parse_response(&value)
    }
}

fn wire_message(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::Human { content } => json!({"role": "user", "content": content}),
        Message::Ai {
            content,
            tool_calls,
            ..
        } => {
            let mut wire = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                wire["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {"name": call.name, "arguments": call.args.to_string()}
                        })
                    })
                    .collect();
            }
            wire
        }
        Message::Tool {
            content,
            tool_call_id,
            ..
        } => json!({"role": "tool", "tool_call_id": tool_call_id, "content": content}),
    }
}

fn parse_response(value: &Value) -> Result<ModelResponse, ModelError> {
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::Decode("response has no choices".into()))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?;
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?;
                    let raw = function
                        .get("arguments")
                        .and_then(Value::as_str)
                        .unwrap_or("{}");
                    let args = serde_json::from_str(raw).unwrap_or_else(|_| json!({"input": raw}));
                    Some(ToolCall::new(id, name, args))
                })
                .collect()
        })
        .unwrap_or_default();

    let native_search_used = message
        .get("annotations")
        .and_then(Value::as_array)
        .is_some_and(|annotations| {
            annotations
                .iter()
                .any(|a| a.get("type").and_then(Value::as_str) == Some("url_citation"))
        });

    Ok(ModelResponse {
        content,
        tool_calls,
        native_search_used,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelPhase;
    use crate::tools::ToolSpec;

    fn model(provider: Provider) -> OpenAiChatModel {
        OpenAiChatModel::new(
            reqwest::Client::new(),
            "http://localhost".into(),
            SecretValue::new("sk-test"),
            provider,
        )
    }

    #[test]
    fn payload_carries_tools_and_tool_results() {
        let request = ModelRequest {
            model: "gpt-4.1".into(),
            phase: ModelPhase::Researcher,
            messages: vec![
                Message::human("topic"),
                Message::ai_with_tools(
                    "",
                    vec![ToolCall::new("c1", "web_search", json!({"queries": ["a"]}))],
                ),
                Message::tool("results", "web_search", "c1"),
            ],
            max_tokens: 100,
            tools: vec![ToolSpec::new("web_search", "search", json!({"type": "object"}))],
            native_search: None,
            structured_output: None,
        };
        let body = model(Provider::OpenAi).payload(&request);
        assert_eq!(body["max_completion_tokens"], 100);
        assert_eq!(body["tools"][0]["function"]["name"], "web_search");
        assert_eq!(body["messages"][1]["tool_calls"][0]["id"], "c1");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
    }

    #[test]
    fn parses_tool_calls_and_citations() {
        let value = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "think_tool", "arguments": "{\"reflection\":\"ok\"}"}
                    }],
                    "annotations": [{"type": "url_citation"}]
                }
            }]
        });
        let response = parse_response(&value).expect("parses");
        assert_eq!(response.tool_calls[0].str_arg("reflection"), Some("ok"));
        assert!(response.native_search_used);
        assert!(response.content.is_empty());
    }

    #[test]
    fn overflow_statuses_become_token_limit_errors() {
        let openai = model(Provider::OpenAi);
        assert!(
            openai
                .error_for("gpt-4.1", 400, "{\"code\":\"context_length_exceeded\"}".into())
                .is_token_limit()
        );
        assert!(!openai.error_for("gpt-4.1", 500, "context_length_exceeded".into()).is_token_limit());

        let google = model(Provider::Google);
        assert!(google.error_for("gemini-1.5-pro", 429, "RESOURCE_EXHAUSTED".into()).is_token_limit());
    }
}
