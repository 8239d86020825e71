//! Graph state and the patches nodes emit.
//!
//! List channels append by default; a node must ask for [`ListUpdate::Replace`]
//! to overwrite or clear one. Scalar fields overwrite when set.

use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ListUpdate<T> {
    Keep,
    Append(Vec<T>),
    Replace(Vec<T>),
}

impl<T> Default for ListUpdate<T> {
    fn default() -> Self {
        ListUpdate::Keep
    }
}

impl<T> ListUpdate<T> {
    pub fn is_keep(&self) -> bool {
        matches!(self, ListUpdate::Keep)
    }

    pub fn clear() -> Self {
        ListUpdate::Replace(Vec::new())
    }

    pub fn apply(self, target: &mut Vec<T>) {
        match self {
            ListUpdate::Keep => {}
            ListUpdate::Append(items) => target.extend(items),
            ListUpdate::Replace(items) => *target = items,
        }
    }
}

/// Top-level workflow state, persisted as the checkpoint's channel values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentState {
    pub messages: Vec<Message>,
    pub supervisor_messages: Vec<Message>,
    pub research_brief: Option<String>,
    pub research_outline: Option<String>,
    pub notes: Vec<String>,
    pub raw_notes: Vec<String>,
    pub final_report: Option<String>,
    pub report_preview: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "ListUpdate::is_keep")]
    pub supervisor_messages: ListUpdate<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_brief: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_outline: Option<String>,
    #[serde(skip_serializing_if = "ListUpdate::is_keep")]
    pub notes: ListUpdate<String>,
    #[serde(skip_serializing_if = "ListUpdate::is_keep")]
    pub raw_notes: ListUpdate<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_preview: Option<String>,
}

impl AgentPatch {
    pub fn message(message: Message) -> Self {
        Self {
            messages: vec![message],
            ..Default::default()
        }
    }
}

impl AgentState {
    pub fn apply(&mut self, patch: AgentPatch) {
        self.messages.extend(patch.messages);
        patch.supervisor_messages.apply(&mut self.supervisor_messages);
        if patch.research_brief.is_some() {
            self.research_brief = patch.research_brief;
        }
        if patch.research_outline.is_some() {
            self.research_outline = patch.research_outline;
        }
        patch.notes.apply(&mut self.notes);
        patch.raw_notes.apply(&mut self.raw_notes);
        if patch.final_report.is_some() {
            self.final_report = patch.final_report;
        }
        if patch.report_preview.is_some() {
            self.report_preview = patch.report_preview;
        }
    }

    /// A new user turn keeps the conversation but none of the last run's output.
    pub fn begin_turn(&mut self, message: Message) {
        self.messages.push(message);
        self.notes.clear();
        self.raw_notes.clear();
        self.research_outline = None;
        self.final_report = None;
        self.report_preview = None;
    }
}

/// State of one supervised research phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SupervisorState {
    pub supervisor_messages: Vec<Message>,
    pub research_brief: String,
    pub notes: Vec<String>,
    pub research_iterations: u32,
    pub raw_notes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorPatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub supervisor_messages: Vec<Message>,
    #[serde(skip_serializing_if = "ListUpdate::is_keep")]
    pub notes: ListUpdate<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_iterations: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_notes: Vec<String>,
}

impl SupervisorState {
    pub fn apply(&mut self, patch: SupervisorPatch) {
        self.supervisor_messages.extend(patch.supervisor_messages);
        patch.notes.apply(&mut self.notes);
        if let Some(iterations) = patch.research_iterations {
            self.research_iterations = iterations;
        }
        self.raw_notes.extend(patch.raw_notes);
    }
}

/// State of one researcher working a single delegated topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResearcherState {
    pub researcher_messages: Vec<Message>,
    pub tool_call_iterations: u32,
    pub research_topic: String,
    pub compressed_research: Option<String>,
    pub raw_notes: Vec<String>,
}

impl ResearcherState {
    pub fn for_topic(topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            researcher_messages: vec![Message::human(topic.clone())],
            research_topic: topic,
            ..Default::default()
        }
    }

    pub fn apply(&mut self, patch: ResearcherPatch) {
        self.researcher_messages.extend(patch.researcher_messages);
        if let Some(iterations) = patch.tool_call_iterations {
            self.tool_call_iterations = iterations;
        }
        if patch.compressed_research.is_some() {
            self.compressed_research = patch.compressed_research;
        }
        self.raw_notes.extend(patch.raw_notes);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResearcherPatch {
    pub researcher_messages: Vec<Message>,
    pub tool_call_iterations: Option<u32>,
    pub compressed_research: Option<String>,
    pub raw_notes: Vec<String>,
}

/// What a finished researcher hands back to its supervisor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearcherOutput {
    pub compressed_research: String,
    pub raw_notes: Vec<String>,
}
