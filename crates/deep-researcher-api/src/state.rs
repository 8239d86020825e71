use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::StatusCode;
use deep_researcher_core::{
    CheckpointStore, ConfigOverrides, ConfigResolver, FileCheckpointStore, HttpModelFactory,
    InMemoryCheckpointStore, ModelFactory, ResearchService, SessionManager, StubModel, Workflow,
};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::info;

use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    service: ResearchService,
    run_permits: Arc<Semaphore>,
    max_runs: usize,
    auth_token: Option<Arc<String>>,
}

impl AppState {
    pub async fn try_new(config: &AppConfig) -> Result<Self> {
        let checkpoints: Arc<dyn CheckpointStore> = match &config.checkpoint_dir {
            Some(dir) => Arc::new(
                FileCheckpointStore::open(dir.clone())
                    .await
                    .with_context(|| format!("failed to open checkpoint dir {}", dir.display()))?,
            ),
            None => Arc::new(InMemoryCheckpointStore::new()),
        };
        let factory: Arc<dyn ModelFactory> = if config.offline {
            info!("offline mode: using scripted models");
            Arc::new(StubModel::offline())
        } else {
            Arc::new(HttpModelFactory::from_env())
        };
        let resolver = ConfigResolver::from_file(config.config_path.clone())?;

        let service = ResearchService::new(
            SessionManager::in_memory(checkpoints.clone()),
            Workflow::new(factory, checkpoints),
            resolver,
        )
        .with_env_layer(ConfigOverrides::from_env()?);
        Ok(Self::new(service, config))
    }

    pub fn new(service: ResearchService, config: &AppConfig) -> Self {
        Self {
            service,
            run_permits: Arc::new(Semaphore::new(config.max_concurrent_runs)),
            max_runs: config.max_concurrent_runs,
            auth_token: config
                .auth_token
                .as_ref()
                .map(|token| Arc::new(token.to_string())),
        }
    }

    pub fn service(&self) -> &ResearchService {
        &self.service
    }

    pub fn auth_token(&self) -> Option<Arc<String>> {
        self.auth_token.clone()
    }

    /// A slot for one streaming run; held until its stream ends.
    pub fn acquire_run_permit(&self) -> Result<OwnedSemaphorePermit, AppError> {
        match self.run_permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) => Err(AppError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "research capacity reached; retry once a run finishes",
            )),
            Err(TryAcquireError::Closed) => Err(AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "research executor unavailable",
            )),
        }
    }

    pub fn capacity(&self) -> CapacityReport {
        let available = self.run_permits.available_permits();
        CapacityReport {
            max_runs: self.max_runs,
            available_runs: available,
            active_runs: self.max_runs.saturating_sub(available),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReport {
    pub max_runs: usize,
    pub available_runs: usize,
    pub active_runs: usize,
}
