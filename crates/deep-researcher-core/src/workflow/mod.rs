//! The top-level research workflow.
//!
//! `clarifyWithUser -> writeResearchBrief -> [writeResearchOutline] ->
//! researchSupervisor -> finalReportGeneration`, checkpointed after every
//! transition and streamed as [`WorkflowEvent`]s.

mod driver;
mod nodes;

use std::sync::Arc;

use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument};

use crate::checkpoint::CheckpointStore;
use crate::config::ResearchConfig;
use crate::error::DeepResearchError;
use crate::events::{EventEmitter, WorkflowEvent};
use crate::model::{ModelFactory, ModelGateway, RetryPolicy};
use crate::security::SecretValue;
use crate::tools::{InMemoryTokenStore, StandardToolProvider, ToolContext, ToolProvider, TokenStore};

use driver::Run;

pub use nodes::{
    BRIEF_FAILED, CLARIFY_FAILED, REPORT_MAX_RETRIES, REPORT_READY, REPORT_TOKEN_LIMIT,
    REPORT_TRUNCATION_ATTEMPTS,
};

/// One user turn (or a bare resume) on a thread.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub thread_key: String,
    /// `None` or blank continues from the latest checkpoint.
    pub message: Option<String>,
    /// Fully resolved; resolution happens once, before the run.
    pub config: ResearchConfig,
    /// Owner of the thread; scopes cached MCP credentials.
    pub user_id: Option<String>,
    /// Caller credential exchanged for MCP access when the server needs auth.
    pub subject_token: Option<SecretValue>,
}

impl StartRequest {
    pub fn new(thread_key: impl Into<String>, message: Option<String>, config: ResearchConfig) -> Self {
        Self {
            thread_key: thread_key.into(),
            message,
            config,
            user_id: None,
            subject_token: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn message_text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|message| !message.is_empty())
    }
}

/// A running thread. Dropping `events` does not cancel the run.
pub struct RunHandle {
    pub thread_key: String,
    /// True when the thread already had checkpoints before this call.
    pub resumed: bool,
    pub events: UnboundedReceiverStream<WorkflowEvent>,
}

/// Builds and drives runs. Shared across requests.
#[derive(Clone)]
pub struct Workflow {
    factory: Arc<dyn ModelFactory>,
    checkpoints: Arc<dyn CheckpointStore>,
    tools: Option<Arc<dyn ToolProvider>>,
    token_store: Arc<dyn TokenStore>,
    http: reqwest::Client,
    retry: Option<RetryPolicy>,
}

impl Workflow {
    pub fn new(factory: Arc<dyn ModelFactory>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            factory,
            checkpoints,
            tools: None,
            token_store: Arc::new(InMemoryTokenStore::default()),
            http: reqwest::Client::new(),
            retry: None,
        }
    }

    /// Replace the standard tool set, e.g. with fakes.
    pub fn with_tools(mut self, tools: Arc<dyn ToolProvider>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_token_store(mut self, token_store: Arc<dyn TokenStore>) -> Self {
        self.token_store = token_store;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    /// Start or continue `request.thread_key` in the background.
    #[instrument(name = "workflow.start", skip(self, request), fields(thread_key = %request.thread_key))]
    pub async fn start(&self, request: StartRequest) -> Result<RunHandle, DeepResearchError> {
        if request.thread_key.trim().is_empty() {
            return Err(DeepResearchError::InvalidInput("thread key is required".into()));
        }
        let head = self.checkpoints.get(&request.thread_key).await?;
        let resumed = head.is_some();
        let message = request.message_text().map(str::to_string);

        let config = Arc::new(request.config.clone());
        let mut gateway = ModelGateway::new(self.factory.clone(), &config);
        if let Some(retry) = self.retry {
            gateway = gateway.with_retry_policy(retry);
        }
        let tools = match &self.tools {
            Some(tools) => tools.clone(),
            None => {
                let ctx = ToolContext {
                    gateway: gateway.clone(),
                    http: self.http.clone(),
                    token_store: self.token_store.clone(),
                    user_id: request.user_id.clone(),
                    subject_token: request.subject_token.clone(),
                };
                Arc::new(StandardToolProvider::new(ctx)) as Arc<dyn ToolProvider>
            }
        };

        let (events, receiver) = EventEmitter::new();
        let run = Run::new(
            request.thread_key.clone(),
            config,
            gateway,
            tools,
            self.checkpoints.clone(),
            head,
            events,
        );
        info!(resumed, has_message = message.is_some(), "starting workflow run");
        tokio::spawn(run.drive(message));

        Ok(RunHandle {
            thread_key: request.thread_key,
            resumed,
            events: UnboundedReceiverStream::new(receiver),
        })
    }
}
