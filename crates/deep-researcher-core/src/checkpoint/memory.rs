use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;

use super::{Checkpoint, CheckpointStore, ensure_head};
use crate::error::DeepResearchError;

/// Process-local store. Each thread's chain sits behind its own lock.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCheckpointStore {
    threads: Arc<DashMap<String, Arc<Mutex<Vec<Checkpoint>>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, thread_key: &str) -> Arc<Mutex<Vec<Checkpoint>>> {
        self.threads
            .entry(thread_key.to_string())
            .or_default()
            .clone()
    }

    fn existing(&self, thread_key: &str) -> Option<Arc<Mutex<Vec<Checkpoint>>>> {
        self.threads.get(thread_key).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get(&self, thread_key: &str) -> Result<Option<Checkpoint>, DeepResearchError> {
        let Some(chain) = self.existing(thread_key) else {
            return Ok(None);
        };
        Ok(chain.lock().await.last().cloned())
    }

    async fn put(&self, checkpoint: Checkpoint) -> Result<(), DeepResearchError> {
        let chain = self.chain(&checkpoint.thread_key);
        let mut chain = chain.lock().await;
        ensure_head(&checkpoint.thread_key, chain.last(), &checkpoint)?;
        chain.push(checkpoint);
        Ok(())
    }

    async fn list(&self, thread_key: &str) -> Result<Vec<Checkpoint>, DeepResearchError> {
        let Some(chain) = self.existing(thread_key) else {
            return Ok(Vec::new());
        };
        Ok(chain.lock().await.clone())
    }

    async fn get_at(
        &self,
        thread_key: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, DeepResearchError> {
        let Some(chain) = self.existing(thread_key) else {
            return Ok(None);
        };
        Ok(chain
            .lock()
            .await
            .iter()
            .find(|checkpoint| checkpoint.id == checkpoint_id)
            .cloned())
    }

    async fn delete_thread(&self, thread_key: &str) -> Result<(), DeepResearchError> {
        self.threads.remove(thread_key);
        Ok(())
    }
}
