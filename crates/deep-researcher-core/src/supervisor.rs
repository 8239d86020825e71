//! The research supervisor: plans, delegates to researchers, decides when to stop.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::config::ResearchConfig;
use crate::error::DeepResearchError;
use crate::graph::{Next, Step, SupervisorNode};
use crate::message::{Message, ToolCall, tool_message_contents};
use crate::metrics::record_transition;
use crate::model::{ModelCall, ModelGateway, ModelPhase};
use crate::prompts::{lead_researcher_prompt, today_str};
use crate::researcher::Researcher;
use crate::state::{ListUpdate, SupervisorPatch, SupervisorState};
use crate::tools::{
    CONDUCT_RESEARCH, RESEARCH_COMPLETE, THINK_TOOL, Tool, ToolSpec, conduct_research_spec,
    ResearchCompleteTool, ThinkTool,
};

pub const RESEARCH_COMPLETE_MESSAGE: &str = "Research complete. Writing your report...";
pub const TOKEN_LIMIT_MESSAGE: &str = "Token limit reached. Proceeding with available findings...";
pub const INTERRUPTED_MESSAGE: &str = "Research interrupted. Proceeding with available findings...";
const NO_FINDINGS: &str = "Error: No research findings";

type SupervisorStep = Step<SupervisorNode, SupervisorPatch>;

/// Receives every supervisor transition so the caller can checkpoint and
/// stream mid-phase progress.
#[async_trait]
pub trait SupervisorObserver: Send + Sync {
    async fn transition(
        &self,
        node: SupervisorNode,
        next: Option<SupervisorNode>,
        state: &SupervisorState,
    ) -> Result<(), DeepResearchError>;
}

/// Observer that ignores everything.
pub struct NoopObserver;

#[async_trait]
impl SupervisorObserver for NoopObserver {
    async fn transition(
        &self,
        _node: SupervisorNode,
        _next: Option<SupervisorNode>,
        _state: &SupervisorState,
    ) -> Result<(), DeepResearchError> {
        Ok(())
    }
}

/// Result of a finished research phase.
#[derive(Debug, Clone)]
pub struct SupervisorOutcome {
    pub state: SupervisorState,
    /// AI message for the user-facing transcript.
    pub exit_message: Message,
}

#[derive(Clone)]
pub struct Supervisor {
    gateway: ModelGateway,
    researcher: Researcher,
    config: Arc<ResearchConfig>,
}

/// How a `supervisorTools` pass ended.
enum ToolsOutcome {
    Continue(SupervisorStep),
    Exit { patch: SupervisorPatch, message: &'static str },
}

impl Supervisor {
    pub fn new(gateway: ModelGateway, researcher: Researcher, config: Arc<ResearchConfig>) -> Self {
        Self {
            gateway,
            researcher,
            config,
        }
    }

    /// Drive the phase from `start` until an exit condition holds.
    #[instrument(
        name = "supervisor.run",
        skip(self, state, observer),
        fields(start = start.name(), iterations = state.research_iterations)
    )]
    pub async fn run(
        &self,
        mut state: SupervisorState,
        start: SupervisorNode,
        observer: &dyn SupervisorObserver,
    ) -> Result<SupervisorOutcome, DeepResearchError> {
        let mut node = start;
        loop {
            match node {
                SupervisorNode::Supervisor => {
                    let step = self.supervisor(&state).await?;
                    record_transition("supervisor", node.name());
                    state.apply(step.patch);
                    let next = match step.next {
                        Next::Node(next) => next,
                        Next::End | Next::Interrupt => SupervisorNode::SupervisorTools,
                    };
                    observer.transition(node, Some(next), &state).await?;
                    node = next;
                }
                SupervisorNode::SupervisorTools => {
                    let outcome = self.supervisor_tools(&state).await;
                    record_transition("supervisor", node.name());
                    match outcome {
                        ToolsOutcome::Continue(step) => {
                            state.apply(step.patch);
                            let next = match step.next {
                                Next::Node(next) => next,
                                Next::End | Next::Interrupt => SupervisorNode::Supervisor,
                            };
                            observer.transition(node, Some(next), &state).await?;
                            node = next;
                        }
                        ToolsOutcome::Exit { patch, message } => {
                            state.apply(patch);
                            observer.transition(node, None, &state).await?;
                            info!(
                                iterations = state.research_iterations,
                                notes = state.notes.len(),
                                "research phase finished"
                            );
                            return Ok(SupervisorOutcome {
                                state,
                                exit_message: Message::ai(message),
                            });
                        }
                    }
                }
            }
        }
    }

    fn tool_specs() -> Vec<ToolSpec> {
        vec![
            conduct_research_spec(),
            ResearchCompleteTool.spec(),
            ThinkTool.spec(),
        ]
    }

    async fn supervisor(&self, state: &SupervisorState) -> Result<SupervisorStep, DeepResearchError> {
        let mut messages = state.supervisor_messages.clone();
        let mut seeded = Vec::new();
        if messages.is_empty() {
            let prompt = Message::system(lead_researcher_prompt(
                &today_str(),
                self.config.max_concurrent_research_units,
                self.config.max_researcher_iterations,
            ));
            messages.push(prompt.clone());
            seeded.push(prompt);
        }

        let call = ModelCall::new(ModelPhase::Supervisor, &self.config.research());
        let response = self
            .gateway
            .invoke_with_tools(&call, messages, Self::tool_specs(), None)
            .await?;
        debug!(
            tool_calls = response.tool_calls.len(),
            names = ?response.tool_calls.iter().map(|call| call.name.as_str()).collect::<Vec<_>>(),
            "supervisor turn"
        );

        seeded.push(response.into_message());
        Ok(Step::goto(
            SupervisorNode::SupervisorTools,
            SupervisorPatch {
                supervisor_messages: seeded,
                research_iterations: Some(state.research_iterations + 1),
                ..Default::default()
            },
        ))
    }

    async fn supervisor_tools(&self, state: &SupervisorState) -> ToolsOutcome {
        let calls: &[ToolCall] = state
            .supervisor_messages
            .last()
            .map(Message::tool_calls)
            .unwrap_or_default();

        let exceeded = state.research_iterations > self.config.max_researcher_iterations;
        let complete = calls.iter().any(|call| call.name == RESEARCH_COMPLETE);
        if exceeded || calls.is_empty() || complete {
            debug!(exceeded, complete, no_calls = calls.is_empty(), "supervisor exiting");
            return exit(state, RESEARCH_COMPLETE_MESSAGE);
        }

        let cap = self.config.max_concurrent_research_units;
        let delegated: Vec<&ToolCall> = calls
            .iter()
            .filter(|call| call.name == CONDUCT_RESEARCH)
            .collect();
        let (allowed, overflow) = delegated.split_at(delegated.len().min(cap));
        if !overflow.is_empty() {
            warn!(allowed = allowed.len(), overflow = overflow.len(), "delegation over capacity");
        }

        info!(delegated = allowed.len(), "dispatching researchers");
        let runs = allowed.iter().map(|call| {
            let topic = call.str_arg("research_topic").unwrap_or_default().to_string();
            async move { self.researcher.run(&topic).await }
        });
        let results = join_all(runs).await;

        let mut findings = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(output) => findings.push(output),
                Err(err) => {
                    warn!(error = %err, "delegated research failed, ending phase");
                    let message = if err.is_token_limit() {
                        TOKEN_LIMIT_MESSAGE
                    } else {
                        INTERRUPTED_MESSAGE
                    };
                    return exit(state, message);
                }
            }
        }

        let raw_notes = findings
            .iter()
            .map(|output| output.raw_notes.join("\n"))
            .collect::<Vec<_>>()
            .join("\n");

        // Every call id gets exactly one answer, in call order.
        let mut responses = Vec::with_capacity(calls.len());
        let mut findings = findings.into_iter();
        let mut delegations = 0usize;
        for call in calls {
            let content = match call.name.as_str() {
                THINK_TOOL => format!(
                    "Reflection recorded: {}",
                    call.str_arg("reflection").unwrap_or_default()
                ),
                CONDUCT_RESEARCH => {
                    delegations += 1;
                    if delegations <= cap {
                        findings
                            .next()
                            .map(|output| output.compressed_research)
                            .filter(|text| !text.is_empty())
                            .unwrap_or_else(|| NO_FINDINGS.to_string())
                    } else {
                        format!(
                            "Error: Exceeded maximum concurrent research units ({cap}). This task was not executed."
                        )
                    }
                }
                other => format!("Error: unknown tool `{other}`"),
            };
            responses.push(Message::tool(content, call.name.clone(), call.id.clone()));
        }

        ToolsOutcome::Continue(Step::goto(
            SupervisorNode::Supervisor,
            SupervisorPatch {
                supervisor_messages: responses,
                raw_notes: if raw_notes.is_empty() { Vec::new() } else { vec![raw_notes] },
                ..Default::default()
            },
        ))
    }
}

fn exit(state: &SupervisorState, message: &'static str) -> ToolsOutcome {
    ToolsOutcome::Exit {
        patch: SupervisorPatch {
            notes: ListUpdate::Replace(tool_message_contents(&state.supervisor_messages)),
            ..Default::default()
        },
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::model::{ModelResponse, RetryPolicy, StubModel};
    use crate::tools::{ToolProvider, ToolRegistry};
    use serde_json::json;

    fn supervisor(stub: StubModel, tools: ToolRegistry, config: ResearchConfig) -> Supervisor {
        let config = Arc::new(config);
        let gateway =
            ModelGateway::new(Arc::new(stub), &config).with_retry_policy(RetryPolicy::immediate(1));
        let tools: Arc<dyn ToolProvider> = Arc::new(tools);
        let researcher = Researcher::new(gateway.clone(), tools, config.clone());
        Supervisor::new(gateway, researcher, config)
    }

    fn seeded() -> SupervisorState {
        SupervisorState {
            supervisor_messages: vec![Message::system("lead"), Message::human("brief")],
            research_brief: "brief".into(),
            ..Default::default()
        }
    }

    fn basic_tools() -> ToolRegistry {
        ToolRegistry::new()
            .with_tool(Arc::new(ResearchCompleteTool))
            .with_tool(Arc::new(ThinkTool))
    }

    #[tokio::test]
    async fn every_call_is_answered_once() {
        let stub = StubModel::from_fn(|request| match request.phase {
            ModelPhase::Supervisor if request.tool_messages().next().is_none() => {
                let mut calls: Vec<ToolCall> = (0..5)
                    .map(|i| {
                        ToolCall::new(
                            format!("delegate-{i}"),
                            CONDUCT_RESEARCH,
                            json!({"research_topic": format!("topic {i}")}),
                        )
                    })
                    .collect();
                calls.push(ToolCall::new("think", THINK_TOOL, json!({"reflection": "plan"})));
                calls.push(ToolCall::new("odd", "mystery", json!({})));
                Ok(ModelResponse::with_tool_calls(calls))
            }
            ModelPhase::Supervisor => Ok(ModelResponse::with_tool_calls(vec![ToolCall::new(
                "done",
                RESEARCH_COMPLETE,
                json!({}),
            )])),
            ModelPhase::Researcher => Ok(ModelResponse::text("no tools needed")),
            _ => Ok(ModelResponse::text(format!(
                "findings about {}",
                request.first_human().unwrap_or_default()
            ))),
        });
        let config = ResearchConfig {
            max_concurrent_research_units: 2,
            ..Default::default()
        };
        let outcome = supervisor(stub.clone(), basic_tools(), config)
            .run(seeded(), SupervisorNode::Supervisor, &NoopObserver)
            .await
            .expect("phase completes");

        let answers: Vec<&Message> = outcome
            .state
            .supervisor_messages
            .iter()
            .filter(|message| message.is_tool())
            .collect();
        assert_eq!(answers.len(), 7);
        assert_eq!(answers[0].content(), "findings about topic 0");
        assert_eq!(answers[1].content(), "findings about topic 1");
        for overflow in &answers[2..5] {
            assert!(overflow.content().contains("Exceeded maximum concurrent research units (2)"));
        }
        assert_eq!(answers[5].content(), "Reflection recorded: plan");
        assert!(answers[6].content().starts_with("Error: unknown tool"));

        assert_eq!(stub.requests_for(ModelPhase::Compress).len(), 2);
        assert_eq!(outcome.state.notes.len(), 7);
        assert_eq!(outcome.exit_message.content(), RESEARCH_COMPLETE_MESSAGE);
        assert_eq!(outcome.state.raw_notes.len(), 1);
    }

    #[tokio::test]
    async fn token_limit_in_a_researcher_ends_the_phase() {
        let stub = StubModel::from_fn(|request| match request.phase {
            ModelPhase::Supervisor => Ok(ModelResponse::with_tool_calls(vec![ToolCall::new(
                "d1",
                CONDUCT_RESEARCH,
                json!({"research_topic": "deep topic"}),
            )])),
            _ => Err(ModelError::token_limit("openai:gpt-4.1", "maximum context length")),
        });
        let outcome = supervisor(stub, basic_tools(), ResearchConfig::default())
            .run(seeded(), SupervisorNode::Supervisor, &NoopObserver)
            .await
            .expect("degrades");
        assert_eq!(outcome.exit_message.content(), TOKEN_LIMIT_MESSAGE);
        assert!(outcome.state.notes.is_empty());
    }

    #[tokio::test]
    async fn missing_tools_interrupt_the_phase() {
        let stub = StubModel::offline();
        let outcome = supervisor(stub, ToolRegistry::new(), ResearchConfig::default())
            .run(seeded(), SupervisorNode::Supervisor, &NoopObserver)
            .await
            .expect("degrades");
        assert_eq!(outcome.exit_message.content(), INTERRUPTED_MESSAGE);
    }

    #[tokio::test]
    async fn iteration_cap_forces_exit() {
        let stub = StubModel::from_fn(|_| {
            Ok(ModelResponse::with_tool_calls(vec![ToolCall::new(
                "t",
                THINK_TOOL,
                json!({"reflection": "again"}),
            )]))
        });
        let config = ResearchConfig {
            max_researcher_iterations: 2,
            ..Default::default()
        };
        let outcome = supervisor(stub.clone(), basic_tools(), config)
            .run(seeded(), SupervisorNode::Supervisor, &NoopObserver)
            .await
            .expect("bounded");
        assert_eq!(stub.requests_for(ModelPhase::Supervisor).len(), 3);
        assert_eq!(outcome.state.research_iterations, 3);
    }
}
