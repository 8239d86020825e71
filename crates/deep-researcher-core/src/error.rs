use std::{path::PathBuf, time::Duration};

use thiserror::Error;

/// Core error type for the research orchestrator.
#[derive(Debug, Error)]
pub enum DeepResearchError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("no tools configured for the researcher; check search_api and mcp_config")]
    NoToolsConfigured,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("checkpoint conflict on {thread_key}: expected parent {expected:?}, current head {found:?}")]
    CheckpointConflict {
        thread_key: String,
        expected: Option<String>,
        found: Option<String>,
    },
    #[error("checkpoint storage error: {0}")]
    Storage(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepResearchError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }

    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string())
    }

    /// True for setup defects that must not be retried.
    pub fn is_configuration(&self) -> bool {
        match self {
            Self::InvalidConfiguration(_)
            | Self::MissingSecret(_)
            | Self::ConfigIo { .. }
            | Self::UnsupportedModel(_)
            | Self::NoToolsConfigured => true,
            Self::Model(err) => err.is_configuration(),
            _ => false,
        }
    }

    pub fn is_token_limit(&self) -> bool {
        matches!(self, Self::Model(err) if err.is_token_limit())
    }
}

/// Failure of a single model invocation.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("token limit exceeded for {model}: {message}")]
    TokenLimitExceeded { model: String, message: String },
    #[error("failed to decode structured output: {0}")]
    Decode(String),
    #[error("provider returned status {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),
    #[error("missing API key for {0}")]
    MissingApiKey(String),
    #[error("{0}")]
    Other(String),
}

impl ModelError {
    pub fn token_limit(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TokenLimitExceeded {
            model: model.into(),
            message: message.into(),
        }
    }

    pub fn is_token_limit(&self) -> bool {
        matches!(self, Self::TokenLimitExceeded { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnsupportedModel(_) | Self::MissingApiKey(_))
    }

    /// Transient failures worth another attempt with identical input.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(_) | Self::Decode(_) => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
