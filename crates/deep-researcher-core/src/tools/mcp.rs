//! Model Context Protocol tools over streamable HTTP.
//!
//! Tools are listed once per researcher run from `<url>/mcp`, filtered by the
//! configured allow-list and wrapped as ordinary [`Tool`]s. When the server
//! needs auth, the caller's token is exchanged at `<url>/oauth/token` and
//! cached in an injected [`TokenStore`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::{Tool, ToolContext, ToolSpec};
use crate::config::McpConfig;
use crate::security::SecretValue;

const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";
const INTERACTION_REQUIRED: i64 = -32003;
const TOKEN_EXCHANGE_GRANT: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";

/// An access token plus its absolute expiry, if the issuer gave one.
#[derive(Debug, Clone)]
pub struct StoredToken {
    pub access_token: SecretValue,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredToken {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Per-user token cache. Injected so deployments can share or persist it.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<StoredToken>;

    async fn put(&self, key: &str, token: StoredToken);
}

#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: DashMap<String, StoredToken>,
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    /// Expired tokens are evicted on read.
    async fn get(&self, key: &str) -> Option<StoredToken> {
        let token = self.tokens.get(key).map(|entry| entry.value().clone())?;
        if token.is_expired() {
            self.tokens.remove(key);
            return None;
        }
        Some(token)
    }

    async fn put(&self, key: &str, token: StoredToken) {
        self.tokens.insert(key.to_string(), token);
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input_schema: Option<Value>,
}

/// JSON-RPC client for one MCP server.
pub struct McpClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<SecretValue>,
    session_id: RwLock<Option<String>>,
    next_id: AtomicU64,
}

impl McpClient {
    pub fn new(http: reqwest::Client, base_url: &str, token: Option<SecretValue>) -> Self {
        Self {
            http,
            endpoint: format!("{}/mcp", base_url.trim_end_matches('/')),
            token,
            session_id: RwLock::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open a session; the server's session id is replayed on later calls.
    pub async fn initialize(&self) -> anyhow::Result<()> {
        self.request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "deep-researcher", "version": env!("CARGO_PKG_VERSION")}
            }),
        )
        .await?;
        self.notify("notifications/initialized").await
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
        let result = self.request("tools/list", json!({})).await?;
        let tools: Vec<RemoteTool> = serde_json::from_value(
            result.get("tools").cloned().unwrap_or_else(|| json!([])),
        )
        .context("MCP server returned a malformed tool list")?;
        Ok(tools
            .into_iter()
            .map(|tool| {
                ToolSpec::new(
                    tool.name,
                    tool.description.unwrap_or_default(),
                    tool.input_schema
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                )
            })
            .collect())
    }

    /// Text content of the result, joined by newlines. `isError` results fail.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> anyhow::Result<String> {
        let result = self
            .request("tools/call", json!({"name": name, "arguments": arguments}))
            .await?;
        let text = result_text(&result);
        if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
            bail!("{text}");
        }
        Ok(text)
    }

    async fn notify(&self, method: &str) -> anyhow::Result<()> {
        let body = json!({"jsonrpc": "2.0", "method": method});
        let response = self.post(&body).await?;
        if !response.status().is_success() {
            warn!(method, status = %response.status(), "MCP notification rejected");
        }
        Ok(())
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params});
        let response = self.post(&body).await?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            *self.session_id.write().await = Some(session.to_string());
        }

        let status = response.status();
        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("text/event-stream"));
        let text = response
            .text()
            .await
            .with_context(|| format!("failed to read MCP `{method}` response"))?;
        if !status.is_success() {
            bail!("MCP `{method}` returned {status}: {text}");
        }

        let payload = if is_event_stream {
            last_sse_payload(&text).ok_or_else(|| anyhow!("MCP `{method}` stream carried no data"))?
        } else {
            text
        };
        let parsed: RpcResponse = serde_json::from_str(&payload)
            .with_context(|| format!("MCP `{method}` returned invalid JSON-RPC"))?;

        if let Some(error) = parsed.error {
            if error.code == INTERACTION_REQUIRED {
                bail!(interaction_required_message(error.data.as_ref()));
            }
            bail!("MCP error {}: {}", error.code, error.message);
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    async fn post(&self, body: &Value) -> anyhow::Result<reqwest::Response> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }
        if let Some(session) = self.session_id.read().await.as_deref() {
            request = request.header(SESSION_HEADER, session);
        }
        request
            .send()
            .await
            .with_context(|| format!("MCP request to {} failed", self.endpoint))
    }
}

/// Last `data:` payload of a server-sent event body.
fn last_sse_payload(body: &str) -> Option<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|data| !data.is_empty())
        .last()
        .map(str::to_string)
}

fn result_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| item.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}

/// Readable text for a "user interaction required" error.
pub(crate) fn interaction_required_message(data: Option<&Value>) -> String {
    let mut message = data
        .and_then(|data| data.pointer("/message/text"))
        .and_then(Value::as_str)
        .unwrap_or("Required interaction")
        .to_string();
    if let Some(url) = data.and_then(|data| data.get("url")).and_then(Value::as_str) {
        message.push(' ');
        message.push_str(url);
    }
    message
}

/// One remote tool, invoked through a shared client.
pub struct McpTool {
    client: Arc<McpClient>,
    spec: ToolSpec,
}

impl McpTool {
    pub fn new(client: Arc<McpClient>, spec: ToolSpec) -> Self {
        Self { client, spec }
    }
}

#[async_trait]
impl Tool for McpTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<String> {
        self.client.call_tool(&self.spec.name, args).await
    }
}

fn token_key(user_id: &str) -> String {
    format!("{user_id}:tokens")
}

async fn exchange_token(
    http: &reqwest::Client,
    base_url: &str,
    subject_token: &SecretValue,
) -> anyhow::Result<StoredToken> {
    let base = base_url.trim_end_matches('/');
    let resource = format!("{base}/mcp");
    let response = http
        .post(format!("{base}/oauth/token"))
        .form(&[
            ("client_id", "mcp_default"),
            ("subject_token", subject_token.expose()),
            ("grant_type", TOKEN_EXCHANGE_GRANT),
            ("resource", resource.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
        ])
        .send()
        .await
        .context("token exchange request failed")?;
    let status = response.status();
    if !status.is_success() {
        bail!("token exchange returned {status}");
    }
    let token: TokenResponse = response
        .json()
        .await
        .context("token exchange returned an unreadable body")?;
    Ok(StoredToken {
        access_token: SecretValue::new(token.access_token),
        expires_at: token
            .expires_in
            .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds)),
    })
}

/// Cached token for the run's user, exchanging the caller credential if needed.
async fn resolve_token(mcp: &McpConfig, ctx: &ToolContext) -> anyhow::Result<Option<SecretValue>> {
    let Some(url) = mcp.url.as_deref() else {
        return Ok(None);
    };
    if let Some(user_id) = ctx.user_id.as_deref()
        && let Some(token) = ctx.token_store.get(&token_key(user_id)).await
    {
        return Ok(Some(token.access_token));
    }
    let Some(subject) = ctx.subject_token.as_ref() else {
        return Ok(None);
    };
    let token = exchange_token(&ctx.http, url, subject).await?;
    let access = token.access_token.clone();
    if let Some(user_id) = ctx.user_id.as_deref() {
        ctx.token_store.put(&token_key(user_id), token).await;
    }
    Ok(Some(access))
}

/// Allowed tools from the configured MCP server.
///
/// Never fails: connection, auth or listing problems are logged and yield no
/// tools, so research proceeds with the built-in ones.
#[instrument(name = "tools.mcp_load", skip(mcp, ctx, existing), fields(url = ?mcp.url))]
pub async fn load_mcp_tools(
    mcp: &McpConfig,
    ctx: &ToolContext,
    existing: &HashSet<String>,
) -> Vec<Arc<dyn Tool>> {
    let Some(url) = mcp.url.as_deref().filter(|url| !url.trim().is_empty()) else {
        return Vec::new();
    };
    if mcp.tools.is_empty() {
        return Vec::new();
    }

    let token = match resolve_token(mcp, ctx).await {
        Ok(token) => token,
        Err(err) => {
            warn!(error = %err, "MCP token exchange failed");
            None
        }
    };
    if mcp.auth_required && token.is_none() {
        warn!("MCP server requires auth but no token is available; skipping MCP tools");
        return Vec::new();
    }

    let client = Arc::new(McpClient::new(ctx.http.clone(), url, token));
    let listed = match client.initialize().await {
        Ok(()) => client.list_tools().await,
        Err(err) => Err(err),
    };
    let specs = match listed {
        Ok(specs) => specs,
        Err(err) => {
            warn!(error = %err, endpoint = client.endpoint(), "failed to load MCP tools");
            return Vec::new();
        }
    };

    let allowed: HashSet<&str> = mcp.tools.iter().map(String::as_str).collect();
    let tools: Vec<Arc<dyn Tool>> = specs
        .into_iter()
        .filter(|spec| allowed.contains(spec.name.as_str()))
        .filter(|spec| {
            let clash = existing.contains(&spec.name);
            if clash {
                warn!(tool = %spec.name, "MCP tool name collides with a built-in tool, skipping");
            }
            !clash
        })
        .map(|spec| Arc::new(McpTool::new(client.clone(), spec)) as Arc<dyn Tool>)
        .collect();
    debug!(count = tools.len(), "MCP tools loaded");
    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResearchConfig;
    use crate::model::{ModelGateway, StubModel};

    #[tokio::test]
    async fn expired_tokens_are_evicted() {
        let store = InMemoryTokenStore::default();
        store
            .put(
                "u1:tokens",
                StoredToken {
                    access_token: SecretValue::new("old"),
                    expires_at: Some(Utc::now() - ChronoDuration::seconds(5)),
                },
            )
            .await;
        store
            .put(
                "u2:tokens",
                StoredToken {
                    access_token: SecretValue::new("fresh"),
                    expires_at: Some(Utc::now() + ChronoDuration::hours(1)),
                },
            )
            .await;

        assert!(store.get("u1:tokens").await.is_none());
        let fresh = store.get("u2:tokens").await.expect("still valid");
        assert_eq!(fresh.access_token.expose(), "fresh");
    }

    #[test]
    fn interaction_errors_become_readable() {
        assert_eq!(interaction_required_message(None), "Required interaction");
        let data = json!({
            "message": {"text": "Please connect your calendar"},
            "url": "https://mcp.example/connect"
        });
        assert_eq!(
            interaction_required_message(Some(&data)),
            "Please connect your calendar https://mcp.example/connect"
        );
    }

    #[test]
    fn sse_bodies_yield_the_last_data_line() {
        let body = "event: message\ndata: {\"a\":1}\n\ndata: {\"b\":2}\n\n";
        assert_eq!(last_sse_payload(body).as_deref(), Some("{\"b\":2}"));
        assert!(last_sse_payload("event: ping\n").is_none());
    }

    #[test]
    fn only_text_content_is_returned() {
        let result = json!({"content": [
            {"type": "text", "text": "line one"},
            {"type": "image", "data": "..."},
            {"type": "text", "text": "line two"}
        ]});
        assert_eq!(result_text(&result), "line one\nline two");
    }

    #[tokio::test]
    async fn empty_allow_list_loads_nothing() {
        let config = ResearchConfig::default();
        let ctx = ToolContext::new(ModelGateway::new(Arc::new(StubModel::offline()), &config));
        let mcp = McpConfig {
            url: Some("http://127.0.0.1:9".into()),
            tools: Vec::new(),
            auth_required: false,
        };
        assert!(load_mcp_tools(&mcp, &ctx, &HashSet::new()).await.is_empty());
    }

    #[tokio::test]
    async fn auth_required_without_token_loads_nothing() {
        let config = ResearchConfig::default();
        let ctx = ToolContext::new(ModelGateway::new(Arc::new(StubModel::offline()), &config));
        let mcp = McpConfig {
            url: Some("http://127.0.0.1:9".into()),
            tools: vec!["lookup".into()],
            auth_required: true,
        };
        assert!(load_mcp_tools(&mcp, &ctx, &HashSet::new()).await.is_empty());
    }
}
