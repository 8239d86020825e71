use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{Checkpoint, CheckpointStore, ensure_head};
use crate::error::DeepResearchError;

/// One append-only JSON-lines file per thread under `root`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FileCheckpointStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, DeepResearchError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|err| DeepResearchError::storage(format!("{}: {err}", root.display())))?;
        Ok(Self {
            root,
            locks: Arc::new(DashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_for(&self, thread_key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(thread_key.to_string())
            .or_default()
            .clone()
    }

    fn path_for(&self, thread_key: &str) -> PathBuf {
        let safe: String = thread_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }

    async fn read_chain(&self, thread_key: &str) -> Result<Vec<Checkpoint>, DeepResearchError> {
        let path = self.path_for(thread_key);
        let raw = match fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(DeepResearchError::storage(format!("{}: {err}", path.display())));
            }
        };

        let mut chain = Vec::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Checkpoint>(line) {
                Ok(checkpoint) => chain.push(checkpoint),
                // A torn final line from a crash mid-write is skipped; the
                // previous head stays authoritative.
                Err(err) => warn!(
                    path = %path.display(),
                    line = line_no + 1,
                    error = %err,
                    "skipping unreadable checkpoint line"
                ),
            }
        }
        Ok(chain)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get(&self, thread_key: &str) -> Result<Option<Checkpoint>, DeepResearchError> {
        Ok(self.read_chain(thread_key).await?.pop())
    }

    async fn put(&self, checkpoint: Checkpoint) -> Result<(), DeepResearchError> {
        let lock = self.lock_for(&checkpoint.thread_key);
        let _guard = lock.lock().await;

        let chain = self.read_chain(&checkpoint.thread_key).await?;
        ensure_head(&checkpoint.thread_key, chain.last(), &checkpoint)?;

        let mut line = serde_json::to_string(&checkpoint).map_err(DeepResearchError::storage)?;
        line.push('\n');
        let path = self.path_for(&checkpoint.thread_key);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| DeepResearchError::storage(format!("{}: {err}", path.display())))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| DeepResearchError::storage(format!("{}: {err}", path.display())))?;
        file.flush().await.map_err(DeepResearchError::storage)?;
        debug!(thread_key = %checkpoint.thread_key, step = checkpoint.step, "checkpoint written");
        Ok(())
    }

    async fn list(&self, thread_key: &str) -> Result<Vec<Checkpoint>, DeepResearchError> {
        self.read_chain(thread_key).await
    }

    async fn get_at(
        &self,
        thread_key: &str,
        checkpoint_id: &str,
    ) -> Result<Option<Checkpoint>, DeepResearchError> {
        Ok(self
            .read_chain(thread_key)
            .await?
            .into_iter()
            .find(|checkpoint| checkpoint.id == checkpoint_id))
    }

    async fn delete_thread(&self, thread_key: &str) -> Result<(), DeepResearchError> {
        let lock = self.lock_for(thread_key);
        let _guard = lock.lock().await;
        let path = self.path_for(thread_key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DeepResearchError::storage(format!("{}: {err}", path.display()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ThreadStatus;
    use crate::graph::WorkflowNode;
    use crate::message::Message;
    use crate::state::AgentState;
    use tempfile::tempdir;

    #[tokio::test]
    async fn chain_survives_reopening() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).await.expect("opens");

        let state = AgentState {
            messages: vec![Message::human("What is new in battery chemistry?")],
            ..Default::default()
        };
        let root = Checkpoint::root(
            "thread-abc",
            ThreadStatus::Running {
                next: WorkflowNode::WriteResearchBrief,
            },
            state.clone(),
        );
        store.put(root.clone()).await.expect("root");
        let done = Checkpoint::next("thread-abc", Some(&root), ThreadStatus::Completed, state, None);
        store.put(done.clone()).await.expect("child");

        let reopened = FileCheckpointStore::open(dir.path()).await.expect("reopens");
        let chain = reopened.list("thread-abc").await.expect("lists");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, root.id);
        assert_eq!(reopened.get("thread-abc").await.expect("head"), Some(done));
    }

    #[tokio::test]
    async fn conflicting_writers_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).await.expect("opens");
        let root = Checkpoint::root("t", ThreadStatus::AwaitingInput, AgentState::default());
        store.put(root.clone()).await.expect("root");
        let orphan = Checkpoint::root("t", ThreadStatus::AwaitingInput, AgentState::default());
        assert!(matches!(
            store.put(orphan).await,
            Err(DeepResearchError::CheckpointConflict { .. })
        ));
    }

    #[tokio::test]
    async fn missing_threads_are_empty_and_deletable() {
        let dir = tempdir().expect("tempdir");
        let store = FileCheckpointStore::open(dir.path()).await.expect("opens");
        assert!(store.get("nope").await.expect("reads").is_none());
        store.delete_thread("nope").await.expect("no-op delete");
    }
}
