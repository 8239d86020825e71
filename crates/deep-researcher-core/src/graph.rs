//! Node identifiers and step results shared by the three state machines.
//!
//! Each node returns a [`Step`]: where to go next plus the state delta to
//! apply. Drivers own the loop; nodes never mutate state directly.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq)]
pub enum Next<N> {
    Node(N),
    /// Halt and wait for the next user turn.
    Interrupt,
    End,
}

#[derive(Debug, Clone)]
pub struct Step<N, P> {
    pub next: Next<N>,
    pub patch: P,
}

impl<N, P> Step<N, P> {
    pub fn goto(node: N, patch: P) -> Self {
        Self {
            next: Next::Node(node),
            patch,
        }
    }

    pub fn end(patch: P) -> Self {
        Self {
            next: Next::End,
            patch,
        }
    }

    pub fn interrupt(patch: P) -> Self {
        Self {
            next: Next::Interrupt,
            patch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkflowNode {
    ClarifyWithUser,
    WriteResearchBrief,
    WriteResearchOutline,
    ResearchSupervisor,
    FinalReportGeneration,
}

impl WorkflowNode {
    pub fn name(self) -> &'static str {
        match self {
            WorkflowNode::ClarifyWithUser => "clarifyWithUser",
            WorkflowNode::WriteResearchBrief => "writeResearchBrief",
            WorkflowNode::WriteResearchOutline => "writeResearchOutline",
            WorkflowNode::ResearchSupervisor => "researchSupervisor",
            WorkflowNode::FinalReportGeneration => "finalReportGeneration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorNode {
    Supervisor,
    SupervisorTools,
}

impl SupervisorNode {
    pub fn name(self) -> &'static str {
        match self {
            SupervisorNode::Supervisor => "supervisor",
            SupervisorNode::SupervisorTools => "supervisorTools",
        }
    }

    /// Event label as seen from the top-level graph.
    pub fn qualified_name(self) -> &'static str {
        match self {
            SupervisorNode::Supervisor => "researchSupervisor.supervisor",
            SupervisorNode::SupervisorTools => "researchSupervisor.supervisorTools",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResearcherNode {
    Researcher,
    ResearcherTools,
    CompressResearch,
}

impl ResearcherNode {
    pub fn name(self) -> &'static str {
        match self {
            ResearcherNode::Researcher => "researcher",
            ResearcherNode::ResearcherTools => "researcherTools",
            ResearcherNode::CompressResearch => "compressResearch",
        }
    }
}
