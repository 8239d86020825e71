//! Model gateway: provider-neutral chat invocation with tool binding,
//! structured output and transient-error retry.

mod anthropic;
mod gateway;
mod openai;
mod stub;
mod token_limits;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;
use crate::message::{Message, ToolCall};
use crate::security::SecretValue;
use crate::tools::ToolSpec;

pub use anthropic::AnthropicChatModel;
pub use gateway::{
    ClarifyWithUser, ModelCall, ModelGateway, ResearchQuestion, RetryPolicy, StructuredOutput,
    WebpageSummary,
};
pub use openai::OpenAiChatModel;
pub use stub::StubModel;
pub use token_limits::{is_token_limit_exceeded, model_token_limit, resolve_max_tokens};

const DEFAULT_OPENAI_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_ANTHROPIC_BASE: &str = "https://api.anthropic.com";
const GOOGLE_OPENAI_COMPAT_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";

/// Which workflow step a model call serves. Used for metrics and offline routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelPhase {
    Clarify,
    Brief,
    Outline,
    Supervisor,
    Researcher,
    Compress,
    FinalReport,
    Summarize,
}

impl ModelPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelPhase::Clarify => "clarify",
            ModelPhase::Brief => "brief",
            ModelPhase::Outline => "outline",
            ModelPhase::Supervisor => "supervisor",
            ModelPhase::Researcher => "researcher",
            ModelPhase::Compress => "compress",
            ModelPhase::FinalReport => "final_report",
            ModelPhase::Summarize => "summarize",
        }
    }
}

/// Provider-hosted web search the model may run on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeSearch {
    Openai,
    Anthropic,
}

/// JSON schema the response must follow.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: &'static str,
    pub schema: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Model name with any provider prefix already stripped.
    pub model: String,
    pub phase: ModelPhase,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub tools: Vec<ToolSpec>,
    pub native_search: Option<NativeSearch>,
    pub structured_output: Option<OutputSchema>,
}

impl ModelRequest {
    pub fn tool_messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|message| message.is_tool())
    }

    pub fn first_human(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|message| matches!(message, Message::Human { .. }))
            .map(Message::content)
    }

    pub fn last_human(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| matches!(message, Message::Human { .. }))
            .map(Message::content)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub native_search_used: bool,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Default::default()
        }
    }

    pub fn into_message(self) -> Message {
        Message::Ai {
            content: self.content,
            tool_calls: self.tool_calls,
            native_search_used: self.native_search_used,
        }
    }
}

/// One concrete chat backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError>;
}

/// Turns a logical model id into a client.
pub trait ModelFactory: Send + Sync {
    fn resolve(
        &self,
        model: &str,
        api_key: Option<SecretValue>,
    ) -> Result<Arc<dyn ChatModel>, ModelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
}

impl Provider {
    /// Split `model` into its provider and the provider-local model name.
    pub fn parse(model: &str) -> Result<(Provider, String), ModelError> {
        let trimmed = model.trim();
        let lower = trimmed.to_ascii_lowercase();
        let strip = |prefix: &str| trimmed[prefix.len()..].to_string();

        if lower.starts_with("openai:") {
            return Ok((Provider::OpenAi, strip("openai:")));
        }
        if lower.starts_with("anthropic:") {
            return Ok((Provider::Anthropic, strip("anthropic:")));
        }
        if lower.starts_with("google:") {
            return Ok((Provider::Google, strip("google:")));
        }
        if lower.starts_with("gemini:") {
            return Ok((Provider::Google, strip("gemini:")));
        }
        if lower.starts_with("gpt-") || ["o1", "o3", "o4"].iter().any(|p| lower.starts_with(p)) {
            return Ok((Provider::OpenAi, trimmed.to_string()));
        }
        if lower.starts_with("claude-") {
            return Ok((Provider::Anthropic, trimmed.to_string()));
        }
        if lower.contains("gemini") {
            return Ok((Provider::Google, trimmed.to_string()));
        }
        Err(ModelError::UnsupportedModel(trimmed.to_string()))
    }

    pub fn key_var(self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Anthropic => "ANTHROPIC_API_KEY",
            Provider::Google => "GOOGLE_API_KEY",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
        }
    }
}

/// Real providers over HTTP.
#[derive(Debug, Clone)]
pub struct HttpModelFactory {
    client: reqwest::Client,
    openai_base: String,
    anthropic_base: String,
    google_base: String,
}

impl HttpModelFactory {
    /// Base URLs may be redirected with `OPENAI_BASE_URL` / `ANTHROPIC_BASE_URL`.
    pub fn from_env() -> Self {
        let env_or = |name: &str, default: &str| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        Self::new(
            env_or("OPENAI_BASE_URL", DEFAULT_OPENAI_BASE),
            env_or("ANTHROPIC_BASE_URL", DEFAULT_ANTHROPIC_BASE),
            GOOGLE_OPENAI_COMPAT_BASE.to_string(),
        )
    }

    pub fn new(openai_base: String, anthropic_base: String, google_base: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            openai_base,
            anthropic_base,
            google_base,
        }
    }
}

impl ModelFactory for HttpModelFactory {
    fn resolve(
        &self,
        model: &str,
        api_key: Option<SecretValue>,
    ) -> Result<Arc<dyn ChatModel>, ModelError> {
        let (provider, _) = Provider::parse(model)?;
        let api_key = api_key.ok_or_else(|| ModelError::MissingApiKey(provider.key_var().into()))?;
        let client: Arc<dyn ChatModel> = match provider {
            Provider::OpenAi => Arc::new(OpenAiChatModel::new(
                self.client.clone(),
                self.openai_base.clone(),
                api_key,
                Provider::OpenAi,
            )),
            Provider::Google => Arc::new(OpenAiChatModel::new(
                self.client.clone(),
                self.google_base.clone(),
                api_key,
                Provider::Google,
            )),
            Provider::Anthropic => Arc::new(AnthropicChatModel::new(
                self.client.clone(),
                self.anthropic_base.clone(),
                api_key,
            )),
        };
        Ok(client)
    }
}

pub(crate) fn transport_error(err: reqwest::Error) -> ModelError {
    if err.is_timeout() {
        ModelError::Timeout(std::time::Duration::from_secs(300))
    } else if err.is_decode() {
        ModelError::Decode(err.to_string())
    } else {
        ModelError::Transport(err.to_string())
    }
}
