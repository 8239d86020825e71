use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, SupervisorCheckpoint, ThreadStatus};
use crate::config::ResearchConfig;
use crate::error::DeepResearchError;
use crate::events::EventEmitter;
use crate::graph::{Next, SupervisorNode, WorkflowNode};
use crate::message::Message;
use crate::metrics::record_transition;
use crate::model::ModelGateway;
use crate::researcher::Researcher;
use crate::state::{AgentState, SupervisorState};
use crate::supervisor::{Supervisor, SupervisorObserver};
use crate::tools::ToolProvider;

/// Everything one run of one thread needs.
pub(super) struct Run {
    pub(super) thread_key: String,
    pub(super) config: Arc<ResearchConfig>,
    pub(super) gateway: ModelGateway,
    pub(super) supervisor: Supervisor,
    checkpoints: Arc<dyn CheckpointStore>,
    head: Mutex<Option<Checkpoint>>,
    events: EventEmitter,
}

/// Where the loop starts.
struct Entry {
    state: AgentState,
    node: WorkflowNode,
    supervisor: Option<SupervisorCheckpoint>,
}

impl Run {
    pub(super) fn new(
        thread_key: String,
        config: Arc<ResearchConfig>,
        gateway: ModelGateway,
        tools: Arc<dyn ToolProvider>,
        checkpoints: Arc<dyn CheckpointStore>,
        head: Option<Checkpoint>,
        events: EventEmitter,
    ) -> Self {
        let researcher = Researcher::new(gateway.clone(), tools, config.clone());
        let supervisor = Supervisor::new(gateway.clone(), researcher, config.clone());
        Self {
            thread_key,
            config,
            gateway,
            supervisor,
            checkpoints,
            head: Mutex::new(head),
            events,
        }
    }

    /// Run to completion, interruption or failure. Never panics on errors:
    /// a failure becomes one `error` event.
    pub(super) async fn drive(self, message: Option<String>) {
        let span = info_span!("workflow.run", thread_key = %self.thread_key);
        async move {
            if let Err(err) = self.execute(message).await {
                warn!(error = %err, "workflow run failed");
                self.events.error(&err);
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, message: Option<String>) -> Result<(), DeepResearchError> {
        let Some(entry) = self.entry(message).await? else {
            return Ok(());
        };
        let Entry {
            mut state,
            mut node,
            mut supervisor,
        } = entry;

        loop {
            let step = self.step(node, &state, supervisor.take()).await?;
            let data = serde_json::to_value(&step.patch).unwrap_or(Value::Null);
            state.apply(step.patch);

            let status = match &step.next {
                Next::Node(next) => ThreadStatus::Running { next: *next },
                Next::Interrupt => ThreadStatus::AwaitingInput,
                Next::End => ThreadStatus::Completed,
            };
            self.commit(status, &state, None).await?;
            record_transition("workflow", node.name());
            self.events.update(node.name(), data);

            match step.next {
                Next::Node(next) => {
                    debug!(from = node.name(), to = next.name(), "workflow transition");
                    node = next;
                }
                Next::Interrupt => {
                    info!("waiting for the user's answer");
                    return Ok(());
                }
                Next::End => {
                    info!(has_report = state.final_report.is_some(), "workflow completed");
                    self.events.finished(state.messages, state.final_report);
                    return Ok(());
                }
            }
        }
    }

    /// Decide where to start from the message and the stored head.
    async fn entry(&self, message: Option<String>) -> Result<Option<Entry>, DeepResearchError> {
        let head = self.head.lock().await.clone();
        match (message, head) {
            (Some(message), head) => {
                let mut state = head.map(|checkpoint| checkpoint.channel_values).unwrap_or_default();
                state.begin_turn(Message::human(message));
                let node = WorkflowNode::ClarifyWithUser;
                self.commit(ThreadStatus::Running { next: node }, &state, None).await?;
                Ok(Some(Entry {
                    state,
                    node,
                    supervisor: None,
                }))
            }
            (None, None) => Err(DeepResearchError::InvalidInput(
                "a message is required to start a new thread".into(),
            )),
            (None, Some(checkpoint)) => match checkpoint.status {
                ThreadStatus::Completed => {
                    debug!("thread already completed, replaying final state");
                    self.events.finished(
                        checkpoint.channel_values.messages,
                        checkpoint.channel_values.final_report,
                    );
                    Ok(None)
                }
                ThreadStatus::AwaitingInput => {
                    debug!("thread is waiting for input, nothing to resume");
                    Ok(None)
                }
                ThreadStatus::Running { next } => {
                    info!(next = next.name(), step = checkpoint.step, "resuming from checkpoint");
                    Ok(Some(Entry {
                        state: checkpoint.channel_values,
                        node: next,
                        supervisor: checkpoint.supervisor,
                    }))
                }
            },
        }
    }

    /// Append a checkpoint after the current head.
    pub(super) async fn commit(
        &self,
        status: ThreadStatus,
        state: &AgentState,
        supervisor: Option<SupervisorCheckpoint>,
    ) -> Result<(), DeepResearchError> {
        let mut head = self.head.lock().await;
        let checkpoint = Checkpoint::next(&self.thread_key, head.as_ref(), status, state.clone(), supervisor);
        self.checkpoints.put(checkpoint.clone()).await?;
        *head = Some(checkpoint);
        Ok(())
    }

    pub(super) fn observer<'a>(&'a self, state: &'a AgentState) -> PhaseObserver<'a> {
        PhaseObserver { run: self, state }
    }
}

/// Checkpoints and streams supervisor progress inside `researchSupervisor`.
pub(super) struct PhaseObserver<'a> {
    run: &'a Run,
    state: &'a AgentState,
}

#[async_trait]
impl SupervisorObserver for PhaseObserver<'_> {
    async fn transition(
        &self,
        node: SupervisorNode,
        next: Option<SupervisorNode>,
        state: &SupervisorState,
    ) -> Result<(), DeepResearchError> {
        if let Some(next) = next {
            self.run
                .commit(
                    ThreadStatus::Running {
                        next: WorkflowNode::ResearchSupervisor,
                    },
                    self.state,
                    Some(SupervisorCheckpoint {
                        next,
                        state: state.clone(),
                    }),
                )
                .await?;
        }
        self.run.events.update(
            node.qualified_name(),
            json!({
                "researchIterations": state.research_iterations,
                "supervisorMessages": state.supervisor_messages.last().map(|message| vec![message]).unwrap_or_default(),
            }),
        );
        Ok(())
    }
}
