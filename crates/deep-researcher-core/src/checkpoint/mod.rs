//! Per-thread checkpoint chains.
//!
//! Every workflow transition writes one [`Checkpoint`] whose `parent_id` is
//! the previous head. Stores reject writes against a stale head, which
//! serialises concurrent runs of the same thread.

mod file;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DeepResearchError;
use crate::graph::{SupervisorNode, WorkflowNode};
use crate::state::{AgentState, SupervisorState};

pub use file::FileCheckpointStore;
pub use memory::InMemoryCheckpointStore;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Where a thread stands after its latest checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ThreadStatus {
    /// `next` runs when the thread is continued.
    Running { next: WorkflowNode },
    /// Halted on a clarifying question.
    AwaitingInput,
    Completed,
}

impl ThreadStatus {
    pub fn is_completed(self) -> bool {
        matches!(self, ThreadStatus::Completed)
    }

    pub fn next_node(self) -> Option<WorkflowNode> {
        match self {
            ThreadStatus::Running { next } => Some(next),
            _ => None,
        }
    }
}

/// Mid-phase supervisor progress, present while research is running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorCheckpoint {
    pub next: SupervisorNode,
    pub state: SupervisorState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub thread_key: String,
    pub parent_id: Option<String>,
    pub step: u64,
    pub version: u32,
    pub status: ThreadStatus,
    pub channel_values: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorCheckpoint>,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// First checkpoint of a thread.
    pub fn root(thread_key: impl Into<String>, status: ThreadStatus, channel_values: AgentState) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_key: thread_key.into(),
            parent_id: None,
            step: 0,
            version: CHECKPOINT_VERSION,
            status,
            channel_values,
            supervisor: None,
            created_at: Utc::now(),
        }
    }

    /// Successor of `parent` on `thread_key`, or a root when there is none.
    pub fn next(
        thread_key: &str,
        parent: Option<&Checkpoint>,
        status: ThreadStatus,
        channel_values: AgentState,
        supervisor: Option<SupervisorCheckpoint>,
    ) -> Self {
        let mut checkpoint = Checkpoint::root(thread_key, status, channel_values);
        if let Some(parent) = parent {
            checkpoint.parent_id = Some(parent.id.clone());
            checkpoint.step = parent.step + 1;
        }
        checkpoint.supervisor = supervisor;
        checkpoint
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Latest checkpoint of the thread.
    async fn get(&self, thread_key: &str) -> Result<Option<Checkpoint>, DeepResearchError>;

    /// Append `checkpoint`. Fails with `CheckpointConflict` unless its
    /// `parent_id` is the current head.
    async fn put(&self, checkpoint: Checkpoint) -> Result<(), DeepResearchError>;

    /// Whole chain, oldest first.
    async fn list(&self, thread_key: &str) -> Result<Vec<Checkpoint>, DeepResearchError>;

    async fn get_at(
        &self,
        thread_key: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, DeepResearchError>;

    async fn delete_thread(&self, thread_key: &str) -> Result<(), DeepResearchError>;
}

/// Parent check shared by the store implementations.
pub(crate) fn ensure_head(
    thread_key: &str,
    head: Option<&Checkpoint>,
    candidate: &Checkpoint,
) -> Result<(), DeepResearchError> {
    let head_id = head.map(|checkpoint| checkpoint.id.clone());
    if candidate.parent_id != head_id {
        return Err(DeepResearchError::CheckpointConflict {
            thread_key: thread_key.to_string(),
            expected: candidate.parent_id.clone(),
            found: head_id,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_with_a_state_tag() {
        let running = ThreadStatus::Running {
            next: WorkflowNode::ResearchSupervisor,
        };
        assert_eq!(
            serde_json::to_value(running).expect("serializes"),
            serde_json::json!({"state": "running", "next": "researchSupervisor"})
        );
        assert_eq!(
            serde_json::to_value(ThreadStatus::AwaitingInput).expect("serializes"),
            serde_json::json!({"state": "awaitingInput"})
        );
    }

    #[test]
    fn successors_link_to_their_parent() {
        let root = Checkpoint::root("t", ThreadStatus::AwaitingInput, AgentState::default());
        let child = Checkpoint::next("t", Some(&root), ThreadStatus::Completed, AgentState::default(), None);
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(child.step, 1);
        assert!(ensure_head("t", Some(&root), &child).is_ok());
        assert!(ensure_head("t", None, &child).is_err());
    }
}
