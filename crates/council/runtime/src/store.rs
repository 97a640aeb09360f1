//! Snapshot stores
//!
//! A snapshot is the full [`WorkflowState`] at some sequence number. Events
//! after that sequence are replayed from the audit trail on recovery.

use crate::error::StoreResult;
use async_trait::async_trait;
use council_engine::WorkflowState;
use council_types::WorkflowId;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot of the workflow
    async fn save(&self, state: &WorkflowState) -> StoreResult<()>;

    async fn load(&self, id: &WorkflowId) -> StoreResult<Option<WorkflowState>>;

    async fn list(&self) -> StoreResult<Vec<WorkflowId>>;
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<BTreeMap<WorkflowId, WorkflowState>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, state: &WorkflowState) -> StoreResult<()> {
        let mut snapshots = self.snapshots.write();
        // Never replace a newer snapshot with an older one
        let stale = snapshots
            .get(&state.id)
            .is_some_and(|s| s.last_sequence > state.last_sequence);
        if !stale {
            snapshots.insert(state.id.clone(), state.clone());
        }
        Ok(())
    }

    async fn load(&self, id: &WorkflowId) -> StoreResult<Option<WorkflowState>> {
        Ok(self.snapshots.read().get(id).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<WorkflowId>> {
        Ok(self.snapshots.read().keys().cloned().collect())
    }
}

/// One `<workflow id>.json` file per workflow, replaced atomically
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub async fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, state: &WorkflowState) -> StoreResult<()> {
        let path = self.path_for(&state.id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            workflow_id = %state.id,
            sequence = state.last_sequence,
            "Snapshot saved"
        );
        Ok(())
    }

    async fn load(&self, id: &WorkflowId) -> StoreResult<Option<WorkflowState>> {
        let path = self.path_for(id);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let body = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    async fn list(&self) -> StoreResult<Vec<WorkflowId>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(WorkflowId::new(stem));
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use council_engine::{EventDraft, Journal};
    use council_types::*;
    use serde_json::json;

    fn state(id: &str, steps: u32) -> WorkflowState {
        let now = Utc::now();
        let root_id = TaskId::sequential(1);
        let root = Task::new(root_id.clone(), 1, Phase::Propose, RoleId::new("planner"), json!({"goal": id}), now);
        let mut journal = Journal::open(WorkflowId::new(id), root, None, now).unwrap();
        for i in 0..steps {
            journal
                .record(EventDraft::new(EventKind::Fault { error: format!("noise {}", i) }, now).task(&root_id))
                .unwrap();
        }
        journal.state().clone()
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(temp_dir.path().join("snapshots")).await.unwrap();
        let snapshot = state("wf-a", 2);

        store.save(&snapshot).await.unwrap();
        store.save(&state("wf-b", 0)).await.unwrap();

        assert_eq!(store.load(&WorkflowId::new("wf-a")).await.unwrap(), Some(snapshot));
        assert_eq!(store.load(&WorkflowId::new("missing")).await.unwrap(), None);
        assert_eq!(
            store.list().await.unwrap(),
            vec![WorkflowId::new("wf-a"), WorkflowId::new("wf-b")]
        );
        // No temp files left behind
        let mut entries = tokio::fs::read_dir(store.dir()).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            assert!(!entry.file_name().to_string_lossy().ends_with(".tmp"));
        }
    }

    #[tokio::test]
    async fn test_memory_store_keeps_newest() {
        let store = MemorySnapshotStore::new();
        let newer = state("wf", 3);
        store.save(&newer).await.unwrap();
        store.save(&state("wf", 1)).await.unwrap();
        assert_eq!(
            store.load(&WorkflowId::new("wf")).await.unwrap().map(|s| s.last_sequence),
            Some(newer.last_sequence)
        );
    }
}
