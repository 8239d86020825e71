//! Sessions, configuration and the workflow behind one entry point.

use std::pin::Pin;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, instrument, warn};

use crate::checkpoint::Checkpoint;
use crate::config::{ConfigOverrides, ConfigResolver, ResearchConfig};
use crate::error::DeepResearchError;
use crate::events::WorkflowEvent;
use crate::graph::WorkflowNode;
use crate::security::SecretValue;
use crate::session::{ResearchSession, SessionManager, SessionStatus};
use crate::workflow::{StartRequest, Workflow};

pub type EventStream = Pin<Box<dyn Stream<Item = WorkflowEvent> + Send>>;

/// One research turn as the outer surfaces see it.
#[derive(Debug, Clone, Default)]
pub struct StartResearch {
    pub user_id: String,
    pub chat_id: Option<String>,
    pub message: Option<String>,
    pub overrides: ConfigOverrides,
    pub subject_token: Option<SecretValue>,
}

pub struct StartResponse {
    pub session_id: String,
    pub thread_key: String,
    pub resumed: bool,
    pub events: EventStream,
}

#[derive(Clone)]
pub struct ResearchService {
    sessions: SessionManager,
    workflow: Workflow,
    resolver: ConfigResolver,
    env_layer: Option<ConfigOverrides>,
}

impl ResearchService {
    /// `sessions` and `workflow` must share one checkpoint store.
    pub fn new(sessions: SessionManager, workflow: Workflow, resolver: ConfigResolver) -> Self {
        Self {
            sessions,
            workflow,
            resolver,
            env_layer: None,
        }
    }

    /// Use a fixed environment layer instead of reading the process environment.
    pub fn with_env_layer(mut self, env_layer: ConfigOverrides) -> Self {
        self.env_layer = Some(env_layer);
        self
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Session snapshot, then request overrides, resolved exactly once.
    pub fn resolve_config(
        &self,
        session: &ResearchSession,
        overrides: &ConfigOverrides,
    ) -> Result<ResearchConfig, DeepResearchError> {
        let call_site = session.configuration.merged(overrides);
        match &self.env_layer {
            Some(env_layer) => self.resolver.resolve_with_env(&call_site, env_layer),
            None => self.resolver.resolve(&call_site),
        }
    }

    #[instrument(name = "service.start", skip(self, request), fields(user_id = %request.user_id))]
    pub async fn start(&self, request: StartResearch) -> Result<StartResponse, DeepResearchError> {
        let session = self
            .sessions
            .get_or_create_session(&request.user_id, request.chat_id.as_deref(), &request.overrides)
            .await?;
        let config = self.resolve_config(&session, &request.overrides)?;

        let has_message = request
            .message
            .as_deref()
            .is_some_and(|message| !message.trim().is_empty());
        if has_message && session.status != SessionStatus::Active {
            self.sessions
                .update_status(&session.id, &session.user_id, SessionStatus::Active, None)
                .await?;
        }

        let mut start = StartRequest::new(session.thread_key.clone(), request.message, config)
            .with_user(session.user_id.clone());
        start.subject_token = request.subject_token;
        let handle = self.workflow.start(start).await?;
        info!(session_id = %session.id, resumed = handle.resumed, "research started");

        let (sender, receiver) = mpsc::unbounded_channel();
        let tracker = StatusTracker {
            sessions: self.sessions.clone(),
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            brief_recorded: false,
        };
        tokio::spawn(tracker.forward(handle.events, sender));

        Ok(StartResponse {
            session_id: session.id,
            thread_key: handle.thread_key,
            resumed: handle.resumed,
            events: Box::pin(UnboundedReceiverStream::new(receiver)),
        })
    }

    /// Latest checkpoint for the user's chat, if the research can continue.
    pub async fn checkpoint_for_chat(
        &self,
        user_id: &str,
        chat_id: &str,
    ) -> Result<Option<(ResearchSession, Checkpoint)>, DeepResearchError> {
        let session = self
            .sessions
            .user_sessions(user_id, None, usize::MAX, 0)
            .await?
            .into_iter()
            .find(|session| session.chat_id.as_deref() == Some(chat_id));
        let Some(session) = session else {
            return Ok(None);
        };
        let checkpoint = self.sessions.resumable_checkpoint(&session).await?;
        Ok(checkpoint.map(|checkpoint| (session, checkpoint)))
    }
}

/// Mirrors workflow progress onto the session record while forwarding events.
struct StatusTracker {
    sessions: SessionManager,
    session_id: String,
    user_id: String,
    brief_recorded: bool,
}

impl StatusTracker {
    async fn forward(
        mut self,
        mut events: impl Stream<Item = WorkflowEvent> + Unpin,
        sender: mpsc::UnboundedSender<WorkflowEvent>,
    ) {
        let mut terminal = false;
        while let Some(event) = events.next().await {
            terminal |= event.is_terminal();
            self.observe(&event).await;
            if sender.send(event).is_err() {
                debug!(session_id = %self.session_id, "event consumer went away");
            }
        }
        if !terminal {
            // The run paused for the user's answer.
            self.set(SessionStatus::ClarificationNeeded, None).await;
        }
    }

    async fn observe(&mut self, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::Update { node, data, .. }
                if !self.brief_recorded && node == WorkflowNode::WriteResearchBrief.name() =>
            {
                if let Some(brief) = data.get("researchBrief").and_then(|brief| brief.as_str()) {
                    self.brief_recorded = true;
                    self.set(SessionStatus::Active, Some(brief.to_string())).await;
                }
            }
            WorkflowEvent::Update { .. } => {}
            WorkflowEvent::Final { .. } => self.set(SessionStatus::Completed, None).await,
            WorkflowEvent::Error { .. } => self.set(SessionStatus::Error, None).await,
        }
    }

    async fn set(&self, status: SessionStatus, brief: Option<String>) {
        if let Err(err) = self
            .sessions
            .update_status(&self.session_id, &self.user_id, status, brief)
            .await
        {
            warn!(session_id = %self.session_id, error = %err, "failed to update session status");
        }
    }
}
