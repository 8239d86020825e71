//! One researcher working a single delegated topic.
//!
//! `researcher -> researcherTools -> (researcher | compressResearch) -> end`.
//! Every instance owns its state; nothing is shared between siblings.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::citations::normalize_citations;
use crate::config::ResearchConfig;
use crate::error::{DeepResearchError, ModelError};
use crate::graph::{Next, ResearcherNode, Step};
use crate::message::{Message, last_ai_message, remove_up_to_last_ai_message};
use crate::metrics::{record_researcher_run, record_token_limit_retry, record_transition};
use crate::model::{ModelCall, ModelGateway, ModelPhase};
use crate::prompts::{
    compress_research_human_message, compress_research_system_prompt, research_system_prompt,
    today_str,
};
use crate::retry::{Recovery, retry_with_shrink};
use crate::state::{ResearcherOutput, ResearcherPatch, ResearcherState};
use crate::tools::{RESEARCH_COMPLETE, ToolProvider, ToolRegistry};

const COMPRESSION_ATTEMPTS: usize = 3;
pub const COMPRESSION_FAILED: &str =
    "Error synthesizing research report: Maximum retries exceeded";

type ResearcherStep = Step<ResearcherNode, ResearcherPatch>;

/// Runs researcher subgraphs. Cheap to clone; one per supervisor.
#[derive(Clone)]
pub struct Researcher {
    gateway: ModelGateway,
    tools: Arc<dyn ToolProvider>,
    config: Arc<ResearchConfig>,
}

impl Researcher {
    pub fn new(gateway: ModelGateway, tools: Arc<dyn ToolProvider>, config: Arc<ResearchConfig>) -> Self {
        Self {
            gateway,
            tools,
            config,
        }
    }

    /// Investigate `topic` and return compressed findings plus raw notes.
    ///
    /// Only configuration problems and model failures in the tool loop are
    /// errors; compression failure is reported in the findings text.
    #[instrument(name = "researcher.run", skip(self, topic), fields(topic_len = topic.len()))]
    pub async fn run(&self, topic: &str) -> Result<ResearcherOutput, DeepResearchError> {
        let registry = self.tools.tools(&self.config).await?;
        let mut state = ResearcherState::for_topic(topic);
        let mut node = ResearcherNode::Researcher;

        let result = loop {
            let step = match node {
                ResearcherNode::Researcher => self.researcher(&state, &registry).await,
                ResearcherNode::ResearcherTools => Ok(self.researcher_tools(&state, &registry).await),
                ResearcherNode::CompressResearch => Ok(self.compress_research(&state).await),
            };
            let step = match step {
                Ok(step) => step,
                Err(err) => break Err(err),
            };
            record_transition("researcher", node.name());
            state.apply(step.patch);
            match step.next {
                Next::Node(next) => node = next,
                Next::End | Next::Interrupt => break Ok(()),
            }
        };

        match result {
            Ok(()) => {
                let compressed_research = state.compressed_research.unwrap_or_default();
                let outcome = if compressed_research == COMPRESSION_FAILED {
                    "compression_failed"
                } else {
                    "ok"
                };
                record_researcher_run(outcome);
                info!(
                    iterations = state.tool_call_iterations,
                    findings_len = compressed_research.len(),
                    outcome,
                    "researcher finished"
                );
                Ok(ResearcherOutput {
                    compressed_research,
                    raw_notes: state.raw_notes,
                })
            }
            Err(err) => {
                record_researcher_run("error");
                warn!(error = %err, "researcher failed");
                Err(err)
            }
        }
    }

    async fn researcher(
        &self,
        state: &ResearcherState,
        registry: &ToolRegistry,
    ) -> Result<ResearcherStep, DeepResearchError> {
        if registry.is_empty() {
            return Err(DeepResearchError::NoToolsConfigured);
        }
        let mut messages = Vec::with_capacity(state.researcher_messages.len() + 1);
        messages.push(Message::system(research_system_prompt(
            self.config.mcp_prompt.as_deref(),
            &today_str(),
        )));
        messages.extend(state.researcher_messages.iter().cloned());

        let call = ModelCall::new(ModelPhase::Researcher, &self.config.research());
        let response = self
            .gateway
            .invoke_with_tools(&call, messages, registry.specs(), registry.native_search())
            .await?;
        debug!(
            tool_calls = response.tool_calls.len(),
            native_search = response.native_search_used,
            "researcher turn"
        );

        Ok(Step::goto(
            ResearcherNode::ResearcherTools,
            ResearcherPatch {
                researcher_messages: vec![response.into_message()],
                tool_call_iterations: Some(state.tool_call_iterations + 1),
                ..Default::default()
            },
        ))
    }

    async fn researcher_tools(&self, state: &ResearcherState, registry: &ToolRegistry) -> ResearcherStep {
        let Some(last) = last_ai_message(&state.researcher_messages) else {
            return Step::goto(ResearcherNode::CompressResearch, ResearcherPatch::default());
        };
        let calls = last.tool_calls();
        if calls.is_empty() && !last.native_search_used() {
            return Step::goto(ResearcherNode::CompressResearch, ResearcherPatch::default());
        }

        let results = registry.execute_all(calls).await;
        let finished = state.tool_call_iterations >= self.config.max_react_tool_calls
            || calls.iter().any(|call| call.name == RESEARCH_COMPLETE);
        let next = if finished {
            ResearcherNode::CompressResearch
        } else {
            ResearcherNode::Researcher
        };

        Step::goto(
            next,
            ResearcherPatch {
                researcher_messages: results,
                ..Default::default()
            },
        )
    }

    /// Clean up the findings. Never fails: exhaustion yields an error text.
    async fn compress_research(&self, state: &ResearcherState) -> ResearcherStep {
        let call = ModelCall::new(ModelPhase::Compress, &self.config.compression());
        let system = compress_research_system_prompt(&today_str());
        let gateway = &self.gateway;

        let outcome = retry_with_shrink(
            COMPRESSION_ATTEMPTS,
            state.researcher_messages.clone(),
            |history: Vec<Message>| {
                let mut messages = Vec::with_capacity(history.len() + 2);
                messages.push(Message::system(system.clone()));
                messages.extend(history);
                messages.push(Message::human(compress_research_human_message()));
                let call = &call;
                async move { gateway.invoke(call, messages).await }
            },
            // Nothing left to prune still counts as an attempt with the same history.
            |history, _| Some(remove_up_to_last_ai_message(&history)),
            |err: &ModelError| {
                if err.is_token_limit() {
                    record_token_limit_retry("compress");
                    Recovery::Shrink
                } else if err.is_configuration() {
                    Recovery::GiveUp
                } else {
                    Recovery::Repeat
                }
            },
        )
        .await;

        let compressed = match outcome {
            Ok(response) => normalize_citations(&response.content),
            Err(failure) => {
                warn!(error = %failure.into_error(), "research compression failed");
                COMPRESSION_FAILED.to_string()
            }
        };

        Step::end(ResearcherPatch {
            compressed_research: Some(compressed),
            raw_notes: vec![raw_notes(&state.researcher_messages)],
            ..Default::default()
        })
    }
}

/// Every tool and AI message content, newline-joined.
fn raw_notes(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|message| message.is_tool() || message.is_ai())
        .map(Message::content)
        .collect::<Vec<_>>()
        .join("\n")
}
