use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{
    ModelFactory, ModelPhase, ModelRequest, ModelResponse, NativeSearch, OutputSchema, Provider,
    is_token_limit_exceeded, resolve_max_tokens,
};
use crate::config::{ModelSettings, ResearchConfig};
use crate::error::ModelError;
use crate::message::Message;
use crate::metrics::record_model_call;
use crate::security::{ApiKeys, SecretValue};
use crate::tools::ToolSpec;

/// Back-off schedule for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    /// Retry without sleeping; meant for tests and offline runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// Which model to call, with what budget, for which step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCall {
    pub model: String,
    pub max_tokens: Option<u32>,
    pub phase: ModelPhase,
}

impl ModelCall {
    pub fn new(phase: ModelPhase, settings: &ModelSettings) -> Self {
        Self {
            model: settings.model.clone(),
            max_tokens: settings.max_tokens,
            phase,
        }
    }
}

/// A response shape the gateway can request and decode.
pub trait StructuredOutput: DeserializeOwned + Send {
    const NAME: &'static str;

    fn schema() -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClarifyWithUser {
    #[serde(default, alias = "needClarification")]
    pub need_clarification: bool,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub verification: Option<String>,
}

impl StructuredOutput for ClarifyWithUser {
    const NAME: &'static str = "ClarifyWithUser";

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "need_clarification": {"type": "boolean"},
                "question": {"type": "string"},
                "verification": {"type": "string"}
            },
            "required": ["need_clarification", "question", "verification"]
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResearchQuestion {
    #[serde(alias = "researchBrief")]
    pub research_brief: String,
}

impl StructuredOutput for ResearchQuestion {
    const NAME: &'static str = "ResearchQuestion";

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {"research_brief": {"type": "string"}},
            "required": ["research_brief"]
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WebpageSummary {
    pub summary: String,
    #[serde(default, alias = "keyExcerpts")]
    pub key_excerpts: String,
}

impl StructuredOutput for WebpageSummary {
    const NAME: &'static str = "Summary";

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": {"type": "string"},
                "key_excerpts": {"type": "string"}
            },
            "required": ["summary", "key_excerpts"]
        })
    }
}

/// Entry point for every model call the workflow makes.
///
/// Credentials are looked up per call. Transient failures are retried here;
/// token-limit and configuration errors are returned to the caller untouched.
#[derive(Clone)]
pub struct ModelGateway {
    factory: Arc<dyn ModelFactory>,
    api_keys: ApiKeys,
    retry: RetryPolicy,
    structured_retries: u32,
}

impl ModelGateway {
    pub fn new(factory: Arc<dyn ModelFactory>, config: &ResearchConfig) -> Self {
        Self {
            factory,
            api_keys: config.api_keys.clone(),
            retry: RetryPolicy::default(),
            structured_retries: config.max_structured_output_retries,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn api_key_for_model(&self, model: &str) -> Option<SecretValue> {
        Provider::parse(model)
            .ok()
            .and_then(|(provider, _)| self.api_keys.lookup(provider.key_var()))
    }

    /// Non-model credentials such as `TAVILY_API_KEY`, under the same lookup rules.
    pub fn api_key(&self, var: &str) -> Option<SecretValue> {
        self.api_keys.lookup(var)
    }

    pub async fn invoke(
        &self,
        call: &ModelCall,
        messages: Vec<Message>,
    ) -> Result<ModelResponse, ModelError> {
        self.invoke_with_tools(call, messages, Vec::new(), None)
            .await
    }

    #[instrument(
        name = "model.invoke",
        skip(self, messages, tools),
        fields(model = %call.model, phase = call.phase.as_str())
    )]
    pub async fn invoke_with_tools(
        &self,
        call: &ModelCall,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
        native_search: Option<NativeSearch>,
    ) -> Result<ModelResponse, ModelError> {
        let request = self.request(call, messages, tools, native_search, None);
        self.send(call, request).await
    }

    /// Ask for JSON matching `T` and decode it, retrying undecodable replies.
    #[instrument(
        name = "model.invoke_structured",
        skip(self, messages),
        fields(model = %call.model, phase = call.phase.as_str(), schema = T::NAME)
    )]
    pub async fn invoke_structured<T: StructuredOutput>(
        &self,
        call: &ModelCall,
        messages: Vec<Message>,
    ) -> Result<T, ModelError> {
        let attempts = self.structured_retries.max(1);
        let mut last_error = ModelError::Decode(format!("no {} attempt made", T::NAME));
        for attempt in 1..=attempts {
            let schema = OutputSchema {
                name: T::NAME,
                schema: T::schema(),
            };
            let request = self.request(call, messages.clone(), Vec::new(), None, Some(schema));
            let response = self.send(call, request).await?;
            match decode_structured::<T>(&response.content) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(attempt, error = %err, "structured output did not decode");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    fn request(
        &self,
        call: &ModelCall,
        messages: Vec<Message>,
        tools: Vec<ToolSpec>,
        native_search: Option<NativeSearch>,
        structured_output: Option<OutputSchema>,
    ) -> ModelRequest {
        let model = Provider::parse(&call.model)
            .map(|(_, name)| name)
            .unwrap_or_else(|_| call.model.clone());
        ModelRequest {
            model,
            phase: call.phase,
            messages,
            max_tokens: resolve_max_tokens(&call.model, call.max_tokens),
            tools,
            native_search,
            structured_output,
        }
    }

    async fn send(
        &self,
        call: &ModelCall,
        request: ModelRequest,
    ) -> Result<ModelResponse, ModelError> {
        let client = self
            .factory
            .resolve(&call.model, self.api_key_for_model(&call.model))?;
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = client
                .invoke(request.clone())
                .await
                .map_err(|err| classify(err, &call.model));
            let elapsed_ms = started.elapsed().as_millis() as u64;
            record_model_call(call.phase.as_str(), elapsed_ms, result.is_ok());

            match result {
                Ok(response) => {
                    debug!(
                        attempt,
                        elapsed_ms,
                        tool_calls = response.tool_calls.len(),
                        "model call completed"
                    );
                    return Ok(response);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient model error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn classify(err: ModelError, model: &str) -> ModelError {
    match &err {
        ModelError::Http { message, .. } | ModelError::Other(message)
            if is_token_limit_exceeded(message, model) =>
        {
            ModelError::token_limit(model, message.clone())
        }
        _ => err,
    }
}

/// Decode the JSON object embedded in `content`, tolerating code fences and prose.
fn decode_structured<T: DeserializeOwned>(content: &str) -> Result<T, ModelError> {
    let trimmed = content.trim();
    let candidate = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(candidate).map_err(|err| ModelError::Decode(err.to_string()))
}
