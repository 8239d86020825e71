#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use deep_researcher_core::model::{RetryPolicy, StubModel};
use deep_researcher_core::tools::{Tool, ToolRegistry, ToolSpec};
use deep_researcher_core::{
    CheckpointStore, InMemoryCheckpointStore, ResearchConfig, RunHandle, SearchApi, StartRequest,
    Workflow, WorkflowEvent,
};
use futures::StreamExt;
use serde_json::{Value, json};

/// No clarification, no outline, no network search.
pub fn quiet_config() -> ResearchConfig {
    ResearchConfig {
        allow_clarification: false,
        generate_outline: false,
        search_api: SearchApi::None,
        ..Default::default()
    }
}

pub fn workflow(model: StubModel, tools: ToolRegistry) -> (Workflow, Arc<InMemoryCheckpointStore>) {
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let workflow = Workflow::new(Arc::new(model), checkpoints.clone())
        .with_tools(Arc::new(tools))
        .with_retry_policy(RetryPolicy::immediate(1));
    (workflow, checkpoints)
}

pub async fn run(
    workflow: &Workflow,
    thread: &str,
    message: Option<&str>,
    config: ResearchConfig,
) -> (RunHandle, Vec<WorkflowEvent>) {
    let mut handle = workflow
        .start(StartRequest::new(thread, message.map(str::to_string), config))
        .await
        .expect("run starts");
    let mut events = Vec::new();
    while let Some(event) = handle.events.next().await {
        events.push(event);
    }
    (handle, events)
}

pub fn final_report(events: &[WorkflowEvent]) -> Option<String> {
    events.iter().find_map(|event| match event {
        WorkflowEvent::Final { final_report, .. } => final_report.clone(),
        _ => None,
    })
}

pub fn labels(events: &[WorkflowEvent]) -> Vec<&str> {
    events.iter().map(WorkflowEvent::label).collect()
}

pub async fn checkpoint_count(store: &InMemoryCheckpointStore, thread: &str) -> usize {
    store.list(thread).await.expect("list checkpoints").len()
}

/// Echoes its `text` argument after `delay_ms`.
pub struct SlowEcho;

#[async_trait]
impl Tool for SlowEcho {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new(
            "slow_echo",
            "Echo text after a delay.",
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "delay_ms": {"type": "integer"}
                }
            }),
        )
    }

    async fn invoke(&self, args: Value) -> anyhow::Result<String> {
        let delay = args.get("delay_ms").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(format!(
            "echo: {}",
            args.get("text").and_then(Value::as_str).unwrap_or_default()
        ))
    }
}

/// Always fails.
pub struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec::new("broken", "Fails every time.", json!({"type": "object"}))
    }

    async fn invoke(&self, _args: Value) -> anyhow::Result<String> {
        bail!("upstream returned 503")
    }
}
