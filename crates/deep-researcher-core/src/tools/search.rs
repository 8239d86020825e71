//! Tavily-backed `web_search` with per-page summarisation.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use super::{Tool, ToolSpec, WEB_SEARCH};
use crate::message::Message;
use crate::model::{ModelCall, ModelGateway, WebpageSummary};
use crate::prompts::{summarize_webpage_prompt, today_str, truncate_chars};
use crate::security::SecretValue;

const TAVILY_SEARCH_URL: &str = "https://api.tavily.com/search";
const DEFAULT_MAX_RESULTS: u64 = 5;
const NO_RESULTS: &str =
    "No valid search results found. Please try different search queries or use a different search API.";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub raw_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

pub struct TavilySearchTool {
    http: reqwest::Client,
    api_key: SecretValue,
    gateway: ModelGateway,
    summarization: ModelCall,
    max_content_length: usize,
    summary_timeout: Duration,
    endpoint: String,
}

impl TavilySearchTool {
    pub fn new(
        http: reqwest::Client,
        api_key: SecretValue,
        gateway: ModelGateway,
        summarization: ModelCall,
        max_content_length: usize,
        summary_timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_key,
            gateway,
            summarization,
            max_content_length,
            summary_timeout,
            endpoint: TAVILY_SEARCH_URL.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn search(&self, query: &str, max_results: u64, topic: &str) -> anyhow::Result<Vec<SearchHit>> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose())
            .json(&json!({
                "query": query,
                "max_results": max_results,
                "topic": topic,
                "include_raw_content": true,
            }))
            .send()
            .await
            .with_context(|| format!("search request failed for `{query}`"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("search API returned {status}: {body}"));
        }
        let parsed: TavilyResponse = response
            .json()
            .await
            .context("search API returned an unreadable body")?;
        Ok(parsed.results)
    }

    /// Summarise one page, falling back to its truncated raw text on timeout or error.
    async fn summarize(&self, hit: &SearchHit) -> String {
        let Some(raw) = hit.raw_content.as_deref().filter(|raw| !raw.trim().is_empty()) else {
            return hit.content.clone();
        };
        let raw = truncate_chars(raw, self.max_content_length);
        let prompt = summarize_webpage_prompt(raw, &today_str());
        let call = self
            .gateway
            .invoke_structured::<WebpageSummary>(&self.summarization, vec![Message::human(prompt)]);

        match tokio::time::timeout(self.summary_timeout, call).await {
            Ok(Ok(summary)) => format!(
                "<summary>\n{}\n</summary>\n\n<key_excerpts>\n{}\n</key_excerpts>",
                summary.summary, summary.key_excerpts
            ),
            Ok(Err(err)) => {
                warn!(url = %hit.url, error = %err, "page summarisation failed, using raw content");
                raw.to_string()
            }
            Err(_) => {
                warn!(
                    url = %hit.url,
                    timeout_secs = self.summary_timeout.as_secs(),
                    "page summarisation timed out, using raw content"
                );
                raw.to_string()
            }
        }
    }
}

#[async_trait]
impl Tool for TavilySearchTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            WEB_SEARCH,
            "A search engine optimised for comprehensive, accurate and trusted results. Useful \
             for answering questions about current events.",
            json!({
                "type": "object",
                "properties": {
                    "queries": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "Search queries to execute"
                    },
                    "max_results": {"type": "integer", "default": DEFAULT_MAX_RESULTS},
                    "topic": {"type": "string", "enum": ["general", "news", "finance"], "default": "general"}
                },
                "required": ["queries"]
            }),
        )
    }

    #[instrument(name = "tool.web_search", skip(self, args))]
    async fn invoke(&self, args: Value) -> anyhow::Result<String> {
        let queries = parse_queries(&args)?;
        let max_results = args
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MAX_RESULTS);
        let topic = args.get("topic").and_then(Value::as_str).unwrap_or("general");

        let batches = join_all(
            queries
                .iter()
                .map(|query| self.search(query, max_results, topic)),
        )
        .await;

        let mut hits = Vec::new();
        let mut last_error = None;
        for batch in batches {
            match batch {
                Ok(found) => hits.extend(found),
                Err(err) => {
                    warn!(error = %err, "search query failed");
                    last_error = Some(err);
                }
            }
        }
        if hits.is_empty()
            && let Some(err) = last_error
        {
            return Err(err);
        }

        let unique = dedupe_by_url(hits);
        debug!(queries = queries.len(), unique = unique.len(), "search results collected");
        let contents = join_all(unique.iter().map(|hit| self.summarize(hit))).await;
        Ok(format_search_output(&unique, &contents))
    }
}

fn parse_queries(args: &Value) -> anyhow::Result<Vec<String>> {
    let queries: Vec<String> = match args.get("queries") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Some(Value::String(single)) => vec![single.clone()],
        _ => args
            .get("query")
            .and_then(Value::as_str)
            .map(|q| vec![q.to_string()])
            .unwrap_or_default(),
    };
    if queries.iter().all(|q| q.trim().is_empty()) {
        return Err(anyhow!("web_search needs at least one non-empty query"));
    }
    Ok(queries)
}

/// First occurrence of each URL wins, in arrival order.
pub(crate) fn dedupe_by_url(hits: Vec<SearchHit>) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|hit| seen.insert(hit.url.clone()))
        .collect()
}

/// Render numbered source blocks for the researcher.
pub fn format_search_output(hits: &[SearchHit], contents: &[String]) -> String {
    if hits.is_empty() {
        return NO_RESULTS.to_string();
    }
    let mut output = String::from("Search results: \n\n");
    for (index, (hit, content)) in hits.iter().zip(contents).enumerate() {
        output.push_str(&format!(
            "\n\n--- SOURCE {}: {} ---\nURL: {}\n\nSUMMARY:\n{}\n\n",
            index + 1,
            hit.title,
            hit.url,
            content
        ));
        output.push_str(&format!("\n\n{}\n", "-".repeat(80)));
    }
    output
}
