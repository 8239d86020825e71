//! Per-run record of workflow transitions, rendered for `--explain` and
//! persisted for `--trace-dir`.

use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::WorkflowEvent;

const MESSAGE_PREVIEW_CHARS: usize = 80;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub node: String,
    pub message: String,
    pub timestamp_ms: u64,
}

impl TraceEvent {
    /// Condense a streamed event into one line.
    pub fn from_workflow_event(event: &WorkflowEvent) -> Self {
        let message = match event {
            WorkflowEvent::Update { data, .. } => describe_update(data),
            WorkflowEvent::Final { final_report, .. } => match final_report {
                Some(report) => format!("report ready ({} chars)", report.chars().count()),
                None => "finished without a report".to_string(),
            },
            WorkflowEvent::Error { error, .. } => format!("failed: {}", preview(error)),
        };
        Self {
            node: event.label().to_string(),
            message,
            timestamp_ms: event.timestamp(),
        }
    }
}

/// Names the fields a node changed, plus its last message when it added one.
fn describe_update(data: &Value) -> String {
    let Some(fields) = data.as_object() else {
        return "no changes".to_string();
    };
    let mut changed: Vec<&str> = fields
        .iter()
        .filter(|(_, value)| !is_empty_change(value))
        .map(|(key, _)| key.as_str())
        .collect();
    changed.sort_unstable();

    let mut line = if changed.is_empty() {
        "no changes".to_string()
    } else {
        format!("updated {}", changed.join(", "))
    };
    let last_message = ["messages", "supervisorMessages"]
        .iter()
        .filter_map(|key| fields.get(*key))
        .filter_map(last_content)
        .next();
    if let Some(content) = last_message {
        let _ = write!(line, ": {}", preview(content));
    }
    line
}

fn is_empty_change(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn last_content(value: &Value) -> Option<&str> {
    value
        .as_array()?
        .last()?
        .get("content")?
        .as_str()
        .filter(|content| !content.trim().is_empty())
}

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(MESSAGE_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceCollector {
    events: Vec<TraceEvent>,
}

impl TraceCollector {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: &WorkflowEvent) {
        self.events.push(TraceEvent::from_workflow_event(event));
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary::from_events(&self.events)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub node: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_events(events: &[TraceEvent]) -> Self {
        let steps = events
            .iter()
            .enumerate()
            .map(|(idx, event)| TraceStep {
                index: idx + 1,
                node: event.node.clone(),
                message: event.message.clone(),
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No trace events recorded.".to_string();
        }
        let mut output = String::from("### Trace Summary\n");
        for step in &self.steps {
            let _ = writeln!(
                output,
                "{}. {} -> {}",
                step.index, step.node, step.message
            );
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no trace events captured".to_string();
        }

        let mut output = String::from("flowchart TD\n  %% auto-generated trace\n");
        for step in &self.steps {
            let node_id = format!("step{}", step.index);
            let label = sanitize_mermaid(&format!("{}: {}", step.node, step.message));
            let _ = writeln!(output, "  {node_id}[\"{label}\"]");
        }

        for idx in 0..self.steps.len().saturating_sub(1) {
            let from = format!("step{}", idx + 1);
            let to = format!("step{}", idx + 2);
            let _ = writeln!(output, "  {from} --> {to}");
        }

        if !output.ends_with('\n') {
            output.push('\n');
        }

        output
    }

    pub fn render_graphviz(&self) -> String {
        if self.steps.is_empty() {
            return "digraph Trace {\n  // no trace events captured\n}".to_string();
        }

        let mut output = String::from("digraph Trace {\n  rankdir=LR;\n  node [shape=box];\n");
        for step in &self.steps {
            let node_id = format!("step{}", step.index);
            let label = format!("{}: {}", step.node, escape_graphviz(&step.message));
            let _ = writeln!(output, "  {node_id} [label=\"{label}\"];");
        }

        for idx in 1..self.steps.len() {
            let _ = writeln!(output, "  step{idx} -> step{};", idx + 1);
        }

        output.push_str("}\n");
        output
    }
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

fn escape_graphviz(text: &str) -> String {
    text.replace('"', "\\\"").replace('\n', " ")
}

pub fn persist_trace<P: AsRef<Path>>(
    dir: P,
    thread_key: &str,
    events: &[TraceEvent],
) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{thread_key}.json"));
    let payload = serde_json::to_vec_pretty(events)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
