//! Events streamed to callers while a thread runs.
//!
//! Every node transition produces one `update`; a run ends with exactly one
//! `final` or `error`, or with nothing when it pauses for clarification.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

use crate::message::Message;
use crate::redact::redact_secrets;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkflowEvent {
    /// A node finished; `data` is the state delta it produced.
    Update {
        node: String,
        data: Value,
        timestamp: u64,
    },
    Final {
        messages: Vec<Message>,
        #[serde(rename = "finalReport")]
        final_report: Option<String>,
        timestamp: u64,
    },
    Error {
        error: String,
        timestamp: u64,
    },
}

impl WorkflowEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            WorkflowEvent::Update { timestamp, .. }
            | WorkflowEvent::Final { timestamp, .. }
            | WorkflowEvent::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowEvent::Update { .. })
    }

    /// Node name for updates, `final` / `error` otherwise.
    pub fn label(&self) -> &str {
        match self {
            WorkflowEvent::Update { node, .. } => node,
            WorkflowEvent::Final { .. } => "final",
            WorkflowEvent::Error { .. } => "error",
        }
    }

    /// One NDJSON line, newline included.
    pub fn to_ndjson(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|err| {
            format!(r#"{{"type":"error","error":"event encoding failed: {err}","timestamp":0}}"#)
        });
        line.push('\n');
        line
    }
}

/// Sending half of a run's event stream. Sends never fail the run: a closed
/// receiver only means nobody is listening any more.
#[derive(Debug, Clone)]
pub struct EventEmitter {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl EventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn update(&self, node: &str, data: Value) {
        self.send(WorkflowEvent::Update {
            node: node.to_string(),
            data,
            timestamp: current_timestamp(),
        });
    }

    pub fn finished(&self, messages: Vec<Message>, final_report: Option<String>) {
        self.send(WorkflowEvent::Final {
            messages,
            final_report,
            timestamp: current_timestamp(),
        });
    }

    /// Error text is redacted before it leaves the process.
    pub fn error(&self, error: impl std::fmt::Display) {
        self.send(WorkflowEvent::Error {
            error: redact_secrets(&error.to_string()),
            timestamp: current_timestamp(),
        });
    }

    fn send(&self, event: WorkflowEvent) {
        let label = event.label().to_string();
        if self.sender.send(event).is_err() {
            tracing::debug!(event = %label, "event receiver dropped");
        }
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_event_uses_camel_case_report() {
        let event = WorkflowEvent::Final {
            messages: vec![],
            final_report: Some("# Report".into()),
            timestamp: 1,
        };
        let value = serde_json::to_value(&event).expect("serializes");
        assert_eq!(value["type"], "final");
        assert_eq!(value["finalReport"], "# Report");
    }

    #[tokio::test]
    async fn errors_are_redacted() {
        let (emitter, mut receiver) = EventEmitter::new();
        emitter.error("provider said: api_key=sk-live-123");
        emitter.update("clarifyWithUser", json!({}));
        drop(emitter);

        let first = receiver.recv().await.expect("error event");
        match first {
            WorkflowEvent::Error { error, .. } => {
                assert!(!error.contains("sk-live-123"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        let second = receiver.recv().await.expect("update event");
        assert_eq!(second.label(), "clarifyWithUser");
        assert!(!second.is_terminal());
        assert!(receiver.recv().await.is_none());
    }

    #[test]
    fn ndjson_lines_end_with_newline() {
        let line = WorkflowEvent::Error {
            error: "boom".into(),
            timestamp: 3,
        }
        .to_ndjson();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
