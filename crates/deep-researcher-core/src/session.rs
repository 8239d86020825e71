//! Research sessions: one per (user, chat), each owning a checkpoint thread.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::config::ConfigOverrides;
use crate::error::DeepResearchError;

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    ClarificationNeeded,
    Completed,
    Error,
    Archived,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::ClarificationNeeded => "clarification_needed",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = DeepResearchError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(SessionStatus::Active),
            "clarification_needed" | "clarificationneeded" => Ok(SessionStatus::ClarificationNeeded),
            "completed" => Ok(SessionStatus::Completed),
            "error" => Ok(SessionStatus::Error),
            "archived" => Ok(SessionStatus::Archived),
            other => Err(DeepResearchError::InvalidInput(format!(
                "unknown session status `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchSession {
    pub id: String,
    pub user_id: String,
    pub chat_id: Option<String>,
    pub thread_key: String,
    pub status: SessionStatus,
    pub research_brief: Option<String>,
    /// Call-site overrides captured at creation, without credentials.
    #[serde(default)]
    pub configuration: ConfigOverrides,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deterministic thread key for a (user, chat) pair.
pub fn thread_key_for(user_id: &str, chat_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(chat_id.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    format!("thread-{}", &hex[..32])
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, session: ResearchSession) -> Result<(), DeepResearchError>;

    async fn update(&self, session: ResearchSession) -> Result<(), DeepResearchError>;

    async fn get(&self, id: &str) -> Result<Option<ResearchSession>, DeepResearchError>;

    async fn remove(&self, id: &str) -> Result<Option<ResearchSession>, DeepResearchError>;

    async fn all(&self) -> Result<Vec<ResearchSession>, DeepResearchError>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, ResearchSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: ResearchSession) -> Result<(), DeepResearchError> {
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn update(&self, session: ResearchSession) -> Result<(), DeepResearchError> {
        match self.sessions.get_mut(&session.id) {
            Some(mut entry) => {
                *entry = session;
                Ok(())
            }
            None => Err(DeepResearchError::SessionNotFound(session.id)),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ResearchSession>, DeepResearchError> {
        Ok(self.sessions.get(id).map(|entry| entry.value().clone()))
    }

    async fn remove(&self, id: &str) -> Result<Option<ResearchSession>, DeepResearchError> {
        Ok(self.sessions.remove(id).map(|(_, session)| session))
    }

    async fn all(&self) -> Result<Vec<ResearchSession>, DeepResearchError> {
        Ok(self.sessions.iter().map(|entry| entry.value().clone()).collect())
    }
}

/// Session lifecycle on top of a [`SessionStore`] and the checkpoint store.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self { store, checkpoints }
    }

    pub fn in_memory(checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()), checkpoints)
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    #[instrument(name = "session.create", skip(self, configuration))]
    pub async fn create_session(
        &self,
        user_id: &str,
        chat_id: Option<&str>,
        configuration: &ConfigOverrides,
    ) -> Result<ResearchSession, DeepResearchError> {
        if user_id.trim().is_empty() {
            return Err(DeepResearchError::InvalidInput("user id is required".into()));
        }
        let thread_key = match chat_id {
            Some(chat_id) => thread_key_for(user_id, chat_id),
            None => format!("thread-{}", Uuid::new_v4().simple()),
        };
        let now = Utc::now();
        let session = ResearchSession {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            chat_id: chat_id.map(str::to_string),
            thread_key,
            status: SessionStatus::Active,
            research_brief: None,
            configuration: configuration.snapshot(),
            created_at: now,
            updated_at: now,
        };
        self.store.insert(session.clone()).await?;
        info!(session_id = %session.id, thread_key = %session.thread_key, "session created");
        Ok(session)
    }

    /// Existing session for (user, chat), or a new one.
    pub async fn get_or_create_session(
        &self,
        user_id: &str,
        chat_id: Option<&str>,
        configuration: &ConfigOverrides,
    ) -> Result<ResearchSession, DeepResearchError> {
        if let Some(chat_id) = chat_id {
            let existing = self
                .store
                .all()
                .await?
                .into_iter()
                .filter(|session| session.user_id == user_id && session.chat_id.as_deref() == Some(chat_id))
                .max_by_key(|session| session.created_at);
            if let Some(session) = existing {
                debug!(session_id = %session.id, "reusing session for chat");
                return Ok(session);
            }
        }
        self.create_session(user_id, chat_id, configuration).await
    }

    /// The session, only if `user_id` owns it.
    pub async fn get_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<ResearchSession>, DeepResearchError> {
        Ok(self
            .store
            .get(session_id)
            .await?
            .filter(|session| session.user_id == user_id))
    }

    /// Newest first.
    pub async fn user_sessions(
        &self,
        user_id: &str,
        status: Option<SessionStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ResearchSession>, DeepResearchError> {
        let mut sessions: Vec<ResearchSession> = self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|session| session.user_id == user_id)
            .filter(|session| status.is_none_or(|status| session.status == status))
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions.into_iter().skip(offset).take(limit).collect())
    }

    /// Set the status and, when given, the research brief. `None` when the
    /// session does not exist or belongs to someone else.
    pub async fn update_status(
        &self,
        session_id: &str,
        user_id: &str,
        status: SessionStatus,
        research_brief: Option<String>,
    ) -> Result<Option<ResearchSession>, DeepResearchError> {
        let Some(mut session) = self.get_session(session_id, user_id).await? else {
            return Ok(None);
        };
        session.status = status;
        if research_brief.is_some() {
            session.research_brief = research_brief;
        }
        session.updated_at = Utc::now();
        self.store.update(session.clone()).await?;
        debug!(session_id, status = status.as_str(), "session status updated");
        Ok(Some(session))
    }

    pub async fn complete_session(
        &self,
        session_id: &str,
        user_id: &str,
        research_brief: Option<String>,
    ) -> Result<Option<ResearchSession>, DeepResearchError> {
        self.update_status(session_id, user_id, SessionStatus::Completed, research_brief)
            .await
    }

    /// Archive completed sessions untouched for more than `days`. Returns how many.
    #[instrument(name = "session.archive_old", skip(self))]
    pub async fn archive_old_sessions(&self, days: i64) -> Result<usize, DeepResearchError> {
        let cutoff = Utc::now() - ChronoDuration::days(days);
        let mut archived = 0;
        for mut session in self.store.all().await? {
            if session.status == SessionStatus::Completed && session.updated_at < cutoff {
                session.status = SessionStatus::Archived;
                self.store.update(session).await?;
                archived += 1;
            }
        }
        info!(archived, "old sessions archived");
        Ok(archived)
    }

    /// Remove the session and its checkpoint thread. `false` when not owned or absent.
    #[instrument(name = "session.delete", skip(self))]
    pub async fn delete_session(&self, session_id: &str, user_id: &str) -> Result<bool, DeepResearchError> {
        let Some(session) = self.get_session(session_id, user_id).await? else {
            return Ok(false);
        };
        self.store.remove(&session.id).await?;
        self.checkpoints.delete_thread(&session.thread_key).await?;
        Ok(true)
    }

    pub async fn session_by_thread_key(
        &self,
        thread_key: &str,
    ) -> Result<Option<ResearchSession>, DeepResearchError> {
        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .find(|session| session.thread_key == thread_key))
    }

    /// Latest checkpoint of a session that has not completed yet.
    pub async fn resumable_checkpoint(
        &self,
        session: &ResearchSession,
    ) -> Result<Option<Checkpoint>, DeepResearchError> {
        if session.status == SessionStatus::Completed {
            return Ok(None);
        }
        self.checkpoints.get(&session.thread_key).await
    }
}
