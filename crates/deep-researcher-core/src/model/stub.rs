//! Scripted model for offline runs and tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use super::{ChatModel, ModelFactory, ModelPhase, ModelRequest, ModelResponse};
use crate::error::ModelError;
use crate::message::ToolCall;
use crate::security::SecretValue;

type Responder = dyn Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync;

/// Answers every request through a closure and records what it was asked.
///
/// Also acts as its own [`ModelFactory`], so any model id resolves to it.
#[derive(Clone)]
pub struct StubModel {
    responder: Arc<Responder>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl StubModel {
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ModelResponse, ModelError> + Send + Sync + 'static,
    {
        Self {
            responder: Arc::new(responder),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Deterministic end-to-end behaviour without network access: one
    /// delegated topic, one reflection per researcher, a cited report.
    pub fn offline() -> Self {
        let ids = Arc::new(AtomicUsize::new(0));
        Self::from_fn(move |request| {
            let next_id = || format!("offline-{}", ids.fetch_add(1, Ordering::Relaxed) + 1);
            let topic = request.first_human().unwrap_or("the research question").to_string();
            let answered = request.tool_messages().next().is_some();

            let response = match request.phase {
                ModelPhase::Clarify => ModelResponse::text(
                    json!({
                        "need_clarification": false,
                        "question": "",
                        "verification": "Understood. Starting research now."
                    })
                    .to_string(),
                ),
                ModelPhase::Brief => {
                    let asked = conversation_excerpt(&topic);
                    ModelResponse::text(
                        json!({ "research_brief": format!("Research the following request: {asked}") })
                            .to_string(),
                    )
                }
                ModelPhase::Outline => ModelResponse::text(
                    "## Outline\n- Background\n- Current evidence\n- Open questions",
                ),
                ModelPhase::Supervisor if !answered => {
                    ModelResponse::with_tool_calls(vec![ToolCall::new(
                        next_id(),
                        "ConductResearch",
                        json!({ "research_topic": topic }),
                    )])
                }
                ModelPhase::Supervisor => ModelResponse::with_tool_calls(vec![ToolCall::new(
                    next_id(),
                    "ResearchComplete",
                    json!({}),
                )]),
                ModelPhase::Researcher if !answered => {
                    ModelResponse::with_tool_calls(vec![ToolCall::new(
                        next_id(),
                        "think_tool",
                        json!({ "reflection": format!("Planning how to cover: {topic}") }),
                    )])
                }
                ModelPhase::Researcher => ModelResponse::text("Enough material gathered."),
                ModelPhase::Compress => ModelResponse::text(format!(
                    "Offline findings on {topic} [1].\n\n### Sources\n[1] Offline notes: https://example.com/offline"
                )),
                ModelPhase::FinalReport => ModelResponse::text(
                    "# Research Report\n\nThis offline report summarises the findings gathered \
                     during research [1].\n\n### Sources\n[1] Offline notes: https://example.com/offline",
                ),
                ModelPhase::Summarize => ModelResponse::text(
                    json!({"summary": "Offline page summary.", "key_excerpts": ""}).to_string(),
                ),
            };
            Ok(response)
        })
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn requests_for(&self, phase: ModelPhase) -> Vec<ModelRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.phase == phase)
            .collect()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|guard| guard.len()).unwrap_or_default()
    }
}

#[async_trait]
impl ChatModel for StubModel {
    async fn invoke(&self, request: ModelRequest) -> Result<ModelResponse, ModelError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        (self.responder)(&request)
    }
}

/// The user's turns quoted inside a prompt's `<Messages>` block.
fn conversation_excerpt(prompt: &str) -> String {
    let inner = prompt
        .split_once("<Messages>")
        .and_then(|(_, rest)| rest.split_once("</Messages>"))
        .map(|(inner, _)| inner)
        .unwrap_or(prompt);
    inner
        .lines()
        .filter_map(|line| line.strip_prefix("Human: "))
        .collect::<Vec<_>>()
        .join(" ")
}

impl ModelFactory for StubModel {
    fn resolve(
        &self,
        _model: &str,
        _api_key: Option<SecretValue>,
    ) -> Result<Arc<dyn ChatModel>, ModelError> {
        Ok(Arc::new(self.clone()))
    }
}
