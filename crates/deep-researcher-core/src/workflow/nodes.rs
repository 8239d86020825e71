//! Bodies of the five top-level nodes.
//!
//! Clarify, brief and outline degrade on model failure; the supervisor
//! phase propagates fatal errors; the report node records its failure as the
//! report text.

use tracing::{info, instrument, warn};

use super::driver::Run;
use crate::checkpoint::SupervisorCheckpoint;
use crate::citations::normalize_citations;
use crate::error::{DeepResearchError, ModelError};
use crate::graph::{Step, SupervisorNode, WorkflowNode};
use crate::message::{Message, buffer_string};
use crate::metrics::record_token_limit_retry;
use crate::model::{ClarifyWithUser, ModelCall, ModelPhase, ResearchQuestion, model_token_limit};
use crate::prompts::{
    clarify_with_user_instructions, final_report_generation_prompt, lead_researcher_prompt,
    research_outline_prompt, today_str, transform_messages_into_research_topic_prompt,
    truncate_chars,
};
use crate::retry::{Recovery, RetryFailure, retry_with_shrink};
use crate::state::{AgentPatch, AgentState, ListUpdate, SupervisorState};

pub const CLARIFY_FAILED: &str = "[LLM Error during clarification. Proceeding to research brief.]";
pub const BRIEF_FAILED: &str = "Error generating research brief. Please try rephrasing your question.";
pub const REPORT_READY: &str = "Research complete. Here is your report.";
pub const REPORT_MAX_RETRIES: &str = "Error: Maximum retries exceeded";
pub const REPORT_TOKEN_LIMIT: &str = "Error: Token limit exceeded.";
/// The first attempt plus three truncations.
pub const REPORT_TRUNCATION_ATTEMPTS: usize = 4;

const REPORT_PREVIEW_CHARS: usize = 500;

type WorkflowStep = Step<WorkflowNode, AgentPatch>;

impl Run {
    pub(super) async fn step(
        &self,
        node: WorkflowNode,
        state: &AgentState,
        resume: Option<SupervisorCheckpoint>,
    ) -> Result<WorkflowStep, DeepResearchError> {
        match node {
            WorkflowNode::ClarifyWithUser => Ok(self.clarify_with_user(state).await),
            WorkflowNode::WriteResearchBrief => Ok(self.write_research_brief(state).await),
            WorkflowNode::WriteResearchOutline => Ok(self.write_research_outline(state).await),
            WorkflowNode::ResearchSupervisor => self.research_supervisor(state, resume).await,
            WorkflowNode::FinalReportGeneration => Ok(self.final_report_generation(state).await),
        }
    }

    #[instrument(name = "workflow.clarify_with_user", skip_all)]
    async fn clarify_with_user(&self, state: &AgentState) -> WorkflowStep {
        if !self.config.allow_clarification {
            return Step::goto(WorkflowNode::WriteResearchBrief, AgentPatch::default());
        }

        let prompt = clarify_with_user_instructions(&buffer_string(&state.messages), &today_str());
        let call = ModelCall::new(ModelPhase::Clarify, &self.config.research());
        match self
            .gateway
            .invoke_structured::<ClarifyWithUser>(&call, vec![Message::human(prompt)])
            .await
        {
            Ok(reply) if reply.need_clarification => {
                let question = reply.question.unwrap_or_default();
                info!("asking the user a clarifying question");
                Step::interrupt(AgentPatch::message(Message::ai(question)))
            }
            Ok(reply) => Step::goto(
                WorkflowNode::WriteResearchBrief,
                AgentPatch::message(Message::ai(reply.verification.unwrap_or_default())),
            ),
            Err(err) => {
                warn!(error = %err, "clarification failed, continuing without it");
                Step::goto(
                    WorkflowNode::WriteResearchBrief,
                    AgentPatch::message(Message::ai(CLARIFY_FAILED)),
                )
            }
        }
    }

    #[instrument(name = "workflow.write_research_brief", skip_all)]
    async fn write_research_brief(&self, state: &AgentState) -> WorkflowStep {
        let date = today_str();
        let prompt = transform_messages_into_research_topic_prompt(&buffer_string(&state.messages), &date);
        let call = ModelCall::new(ModelPhase::Brief, &self.config.research());
        let question = match self
            .gateway
            .invoke_structured::<ResearchQuestion>(&call, vec![Message::human(prompt)])
            .await
        {
            Ok(question) => question,
            Err(err) => {
                warn!(error = %err, "research brief failed, ending the thread");
                return Step::end(AgentPatch::message(Message::ai(BRIEF_FAILED)));
            }
        };

        let brief = question.research_brief;
        let seed = vec![
            Message::system(lead_researcher_prompt(
                &date,
                self.config.max_concurrent_research_units,
                self.config.max_researcher_iterations,
            )),
            Message::human(brief.clone()),
        ];
        let next = if self.config.generate_outline {
            WorkflowNode::WriteResearchOutline
        } else {
            WorkflowNode::ResearchSupervisor
        };
        info!(brief_len = brief.len(), "research brief written");
        Step::goto(
            next,
            AgentPatch {
                messages: vec![Message::ai(brief.clone())],
                supervisor_messages: ListUpdate::Replace(seed),
                research_brief: Some(brief),
                ..Default::default()
            },
        )
    }

    #[instrument(name = "workflow.write_research_outline", skip_all)]
    async fn write_research_outline(&self, state: &AgentState) -> WorkflowStep {
        let prompt = research_outline_prompt(
            state.research_brief.as_deref().unwrap_or_default(),
            &buffer_string(&state.messages),
            &today_str(),
        );
        let call = ModelCall::new(ModelPhase::Outline, &self.config.research());
        match self.gateway.invoke(&call, vec![Message::human(prompt)]).await {
            Ok(response) if !response.content.trim().is_empty() => {
                let outline = response.content;
                Step::goto(
                    WorkflowNode::ResearchSupervisor,
                    AgentPatch {
                        supervisor_messages: ListUpdate::Append(vec![Message::human(format!(
                            "Research Outline:\n{outline}"
                        ))]),
                        research_outline: Some(outline),
                        ..Default::default()
                    },
                )
            }
            Ok(_) => {
                warn!("outline came back empty, researching from the brief alone");
                Step::goto(WorkflowNode::ResearchSupervisor, AgentPatch::default())
            }
            Err(err) => {
                warn!(error = %err, "outline failed, researching from the brief alone");
                Step::goto(WorkflowNode::ResearchSupervisor, AgentPatch::default())
            }
        }
    }

    #[instrument(name = "workflow.research_supervisor", skip_all, fields(resumed = resume.is_some()))]
    async fn research_supervisor(
        &self,
        state: &AgentState,
        resume: Option<SupervisorCheckpoint>,
    ) -> Result<WorkflowStep, DeepResearchError> {
        let (start, phase) = match resume {
            Some(checkpoint) => (checkpoint.next, checkpoint.state),
            None => (
                SupervisorNode::Supervisor,
                SupervisorState {
                    supervisor_messages: state.supervisor_messages.clone(),
                    research_brief: state.research_brief.clone().unwrap_or_default(),
                    ..Default::default()
                },
            ),
        };

        let outcome = self
            .supervisor
            .run(phase, start, &self.observer(state))
            .await?;
        Ok(Step::goto(
            WorkflowNode::FinalReportGeneration,
            AgentPatch {
                messages: vec![outcome.exit_message],
                supervisor_messages: ListUpdate::Replace(outcome.state.supervisor_messages),
                notes: ListUpdate::Append(outcome.state.notes),
                raw_notes: ListUpdate::Append(outcome.state.raw_notes),
                ..Default::default()
            },
        ))
    }

    /// Writes the report. Failures become the report text; never an error.
    #[instrument(name = "workflow.final_report_generation", skip_all, fields(notes = state.notes.len()))]
    async fn final_report_generation(&self, state: &AgentState) -> WorkflowStep {
        let findings = state.notes.join("\n");
        let settings = self.config.final_report();
        let call = ModelCall::new(ModelPhase::FinalReport, &settings);
        let brief = state.research_brief.clone().unwrap_or_default();
        let outline = state.research_outline.clone().unwrap_or_default();
        let transcript = buffer_string(&state.messages);
        let date = today_str();
        let gateway = &self.gateway;
        let mut limit: Option<usize> = None;

        let outcome = retry_with_shrink(
            REPORT_TRUNCATION_ATTEMPTS,
            findings,
            |findings: String| {
                let prompt = final_report_generation_prompt(&brief, &outline, &transcript, &findings, &date);
                let call = &call;
                async move { gateway.invoke(call, vec![Message::human(prompt)]).await }
            },
            |findings, shrinks| {
                let next = match limit {
                    None => model_token_limit(&settings.model)? * 4,
                    Some(previous) => previous * 9 / 10,
                };
                limit = Some(next);
                info!(shrinks, limit = next, "truncating findings for the report");
                Some(truncate_chars(&findings, next).to_string())
            },
            |err: &ModelError| {
                if err.is_token_limit() {
                    record_token_limit_retry("final_report");
                    Recovery::Shrink
                } else {
                    Recovery::GiveUp
                }
            },
        )
        .await;

        let (report, message) = match outcome {
            Ok(response) => {
                let report = normalize_citations(&response.content);
                info!(report_len = report.len(), "final report written");
                return Step::end(AgentPatch {
                    messages: vec![Message::ai(REPORT_READY)],
                    notes: ListUpdate::clear(),
                    report_preview: Some(truncate_chars(&report, REPORT_PREVIEW_CHARS).to_string()),
                    final_report: Some(report),
                    ..Default::default()
                });
            }
            Err(RetryFailure::CannotShrink(_)) => (
                REPORT_TOKEN_LIMIT.to_string(),
                "Report generation failed due to token limits.".to_string(),
            ),
            Err(RetryFailure::Exhausted { attempts, .. }) => {
                warn!(attempts, "final report still over the token limit");
                (
                    REPORT_MAX_RETRIES.to_string(),
                    "Report generation failed after multiple attempts.".to_string(),
                )
            }
            Err(RetryFailure::Aborted(err)) => {
                warn!(error = %err, "final report failed");
                (format!("Error: {err}"), format!("Error generating report: {err}"))
            }
        };

        Step::end(AgentPatch {
            messages: vec![Message::ai(message)],
            notes: ListUpdate::clear(),
            final_report: Some(report),
            ..Default::default()
        })
    }
}
