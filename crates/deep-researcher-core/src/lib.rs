//! Deep research orchestration core.
//!
//! A thread moves through clarification, a research brief, an optional
//! outline, a supervisor that delegates topics to parallel researchers, and
//! a final cited report. Every transition is checkpointed so a thread can be
//! resumed, and streamed as a [`WorkflowEvent`].

pub mod checkpoint;
pub mod citations;
pub mod config;
mod error;
pub mod events;
pub mod graph;
pub mod message;
pub mod metrics;
pub mod model;
pub mod prompts;
mod redact;
pub mod researcher;
pub mod retry;
pub mod security;
pub mod service;
pub mod session;
pub mod state;
pub mod supervisor;
mod telemetry;
pub mod tools;
mod trace;
pub mod workflow;

pub use checkpoint::{
    Checkpoint, CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, ThreadStatus,
};
pub use citations::normalize_citations;
pub use config::{ConfigLoader, ConfigOverrides, ConfigResolver, McpConfig, ResearchConfig, SearchApi};
pub use error::{DeepResearchError, ModelError};
pub use events::WorkflowEvent;
pub use message::{Message, ToolCall};
pub use model::{HttpModelFactory, ModelFactory, StubModel};
pub use redact::redact_secrets;
pub use security::{ApiKeys, SecretValue};
pub use service::{EventStream, ResearchService, StartResearch, StartResponse};
pub use session::{ResearchSession, SessionManager, SessionStatus, thread_key_for};
pub use state::AgentState;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use trace::{TraceCollector, TraceEvent, TraceStep, TraceSummary, persist_trace};
pub use workflow::{RunHandle, StartRequest, Workflow};
