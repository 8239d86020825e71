//! Tools researchers can call, and the registry that runs them.

mod mcp;
mod search;
mod think;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::config::{ResearchConfig, SearchApi};
use crate::error::DeepResearchError;
use crate::message::{Message, ToolCall};
use crate::metrics::record_tool_call;
use crate::model::{ModelCall, ModelGateway, ModelPhase, NativeSearch};
use crate::redact::redact_secrets;
use crate::security::SecretValue;

pub use mcp::{InMemoryTokenStore, McpClient, McpTool, StoredToken, TokenStore, load_mcp_tools};
pub use search::{SearchHit, TavilySearchTool, format_search_output};
pub use think::{
    CONDUCT_RESEARCH, RESEARCH_COMPLETE, ResearchCompleteTool, THINK_TOOL, ThinkTool,
    conduct_research_spec,
};

pub const WEB_SEARCH: &str = "web_search";

/// Name, description and JSON-schema parameters advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;

    async fn invoke(&self, args: Value) -> anyhow::Result<String>;
}

/// Uniquely named tools plus an optional provider-native search.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    entries: Vec<(ToolSpec, Arc<dyn Tool>)>,
    native_search: Option<NativeSearch>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tool` unless its name is taken; the earlier registration wins.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let spec = tool.spec();
        if self.contains(&spec.name) {
            warn!(tool = %spec.name, "duplicate tool name, keeping the earlier registration");
            return false;
        }
        self.entries.push((spec, tool));
        true
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    pub fn set_native_search(&mut self, native_search: Option<NativeSearch>) {
        self.native_search = native_search;
    }

    pub fn native_search(&self) -> Option<NativeSearch> {
        self.native_search
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(spec, _)| spec.name == name)
    }

    pub fn names(&self) -> HashSet<String> {
        self.entries.iter().map(|(spec, _)| spec.name.clone()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|(spec, _)| spec.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when there is nothing at all to bind: no tools and no native search.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.native_search.is_none()
    }

    fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.entries
            .iter()
            .find(|(spec, _)| spec.name == name)
            .map(|(_, tool)| tool)
    }

    /// Run every call concurrently. Results come back in call order, one tool
    /// message per call id; failures become `Error executing tool: ...` text.
    #[instrument(name = "tools.execute_all", skip(self, calls), fields(calls = calls.len()))]
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<Message> {
        let runs = calls.iter().map(|call| async move {
            let content = match self.get(&call.name) {
                None => {
                    record_tool_call(&call.name, false);
                    format!("Error executing tool: unknown tool `{}`", call.name)
                }
                Some(tool) => match tool.invoke(call.args.clone()).await {
                    Ok(output) => {
                        record_tool_call(&call.name, true);
                        output
                    }
                    Err(err) => {
                        record_tool_call(&call.name, false);
                        warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
                        redact_secrets(&format!("Error executing tool: {err:#}"))
                    }
                },
            };
            Message::tool(content, call.name.clone(), call.id.clone())
        });
        join_all(runs).await
    }
}

/// Builds the registry a researcher binds. Injected so tests can supply fakes.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn tools(&self, config: &ResearchConfig) -> Result<ToolRegistry, DeepResearchError>;
}

#[async_trait]
impl ToolProvider for ToolRegistry {
    async fn tools(&self, _config: &ResearchConfig) -> Result<ToolRegistry, DeepResearchError> {
        Ok(self.clone())
    }
}

/// Everything the standard tools need besides configuration.
#[derive(Clone)]
pub struct ToolContext {
    pub gateway: ModelGateway,
    pub http: reqwest::Client,
    pub token_store: Arc<dyn TokenStore>,
    /// Owner of the run; scopes cached MCP tokens.
    pub user_id: Option<String>,
    /// Caller credential exchanged for an MCP access token.
    pub subject_token: Option<SecretValue>,
}

impl ToolContext {
    pub fn new(gateway: ModelGateway) -> Self {
        Self {
            gateway,
            http: reqwest::Client::new(),
            token_store: Arc::new(InMemoryTokenStore::default()),
            user_id: None,
            subject_token: None,
        }
    }
}

/// Completion signal, reflection, the configured search and any allowed MCP tools.
#[instrument(name = "tools.get_all", skip(config, ctx), fields(search_api = config.search_api.as_str()))]
pub async fn get_all_tools(
    config: &ResearchConfig,
    ctx: &ToolContext,
) -> Result<ToolRegistry, DeepResearchError> {
    let mut registry = ToolRegistry::new()
        .with_tool(Arc::new(ResearchCompleteTool))
        .with_tool(Arc::new(ThinkTool));

    match config.search_api {
        SearchApi::Tavily => {
            let api_key = ctx
                .gateway
                .api_key("TAVILY_API_KEY")
                .ok_or_else(|| DeepResearchError::MissingSecret("TAVILY_API_KEY".into()))?;
            registry.register(Arc::new(TavilySearchTool::new(
                ctx.http.clone(),
                api_key,
                ctx.gateway.clone(),
                ModelCall::new(ModelPhase::Summarize, &config.summarization()),
                config.max_content_length,
                config.webpage_summary_timeout(),
            )));
        }
        SearchApi::Openai => registry.set_native_search(Some(NativeSearch::Openai)),
        SearchApi::Anthropic => registry.set_native_search(Some(NativeSearch::Anthropic)),
        SearchApi::None => {}
    }

    if let Some(mcp) = &config.mcp_config {
        let existing = registry.names();
        for tool in load_mcp_tools(mcp, ctx, &existing).await {
            registry.register(tool);
        }
    }

    debug!(tools = registry.len(), native_search = ?registry.native_search(), "tool registry built");
    Ok(registry)
}

/// The production provider: builds a fresh registry per researcher run.
#[derive(Clone)]
pub struct StandardToolProvider {
    ctx: ToolContext,
}

impl StandardToolProvider {
    pub fn new(ctx: ToolContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ToolProvider for StandardToolProvider {
    async fn tools(&self, config: &ResearchConfig) -> Result<ToolRegistry, DeepResearchError> {
        get_all_tools(config, &self.ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StubModel;
    use anyhow::anyhow;
    use serde_json::json;
    use std::time::Duration;

    struct Echo {
        name: &'static str,
        delay_ms: u64,
    }

    #[async_trait]
    impl Tool for Echo {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new(self.name, "echo", json!({"type": "object"}))
        }

        async fn invoke(&self, args: Value) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            Ok(format!("{}:{}", self.name, args["value"]))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn spec(&self) -> ToolSpec {
            ToolSpec::new("broken", "always fails", json!({"type": "object"}))
        }

        async fn invoke(&self, _args: Value) -> anyhow::Result<String> {
            Err(anyhow!("upstream refused api_key=abc123"))
        }
    }

    #[test]
    fn duplicate_names_keep_the_first_tool() {
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Echo { name: "a", delay_ms: 0 })));
        assert!(!registry.register(Arc::new(Echo { name: "a", delay_ms: 5 })));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn failures_and_unknown_tools_become_messages() {
        let registry = ToolRegistry::new()
            .with_tool(Arc::new(Echo { name: "echo", delay_ms: 0 }))
            .with_tool(Arc::new(Broken));
        let calls = vec![
            ToolCall::new("1", "broken", json!({})),
            ToolCall::new("2", "echo", json!({"value": 7})),
            ToolCall::new("3", "missing", json!({})),
        ];
        let results = registry.execute_all(&calls).await;

        assert_eq!(results.len(), 3);
        assert!(results[0].content().starts_with("Error executing tool:"));
        assert!(results[0].content().contains("api_key=[REDACTED]"));
        assert_eq!(results[1].content(), "echo:7");
        assert!(results[2].content().contains("unknown tool"));
    }

    #[tokio::test]
    async fn search_none_still_has_completion_and_think() {
        let config = ResearchConfig {
            search_api: SearchApi::None,
            ..Default::default()
        };
        let stub = StubModel::offline();
        let ctx = ToolContext::new(ModelGateway::new(Arc::new(stub), &config));
        let registry = get_all_tools(&config, &ctx).await.expect("registry");
        let names = registry.names();
        assert!(names.contains(RESEARCH_COMPLETE));
        assert!(names.contains(THINK_TOOL));
        assert!(!names.contains(WEB_SEARCH));
        assert!(registry.native_search().is_none());
    }

    #[tokio::test]
    async fn native_search_is_declared_not_registered() {
        let config = ResearchConfig {
            search_api: SearchApi::Anthropic,
            ..Default::default()
        };
        let ctx = ToolContext::new(ModelGateway::new(Arc::new(StubModel::offline()), &config));
        let registry = get_all_tools(&config, &ctx).await.expect("registry");
        assert_eq!(registry.native_search(), Some(NativeSearch::Anthropic));
        assert_eq!(registry.len(), 2);
    }
}
