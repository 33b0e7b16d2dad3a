use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::log::LogEntry;
use crate::config::replica_file;

const LOG_TARGET: &str = "tablesync::replica::store";

/// On-disk form of a replica: `{ "log": [[index, state], …], "current": state }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedReplica {
    pub log: Vec<LogEntry>,
    pub current: Option<Value>,
}

pub type SharedReplicaStore = Arc<dyn ReplicaStore>;

/// Durable copy of replica state.
///
/// Durability is advisory. A replica is a cache that can be rebuilt from the
/// authority, so callers treat every error here as "no local copy".
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    async fn load(&self, table_id: &str) -> anyhow::Result<Option<PersistedReplica>>;
    async fn save(&self, table_id: &str, replica: &PersistedReplica) -> anyhow::Result<()>;
}

/// One JSON file per table, written through a temp file and renamed into place.
pub struct FileReplicaStore {
    dir: PathBuf,
}

impl FileReplicaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, table_id: &str) -> anyhow::Result<PathBuf> {
        let valid = !table_id.is_empty()
            && table_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && table_id != "."
            && table_id != "..";
        if !valid {
            return Err(anyhow!("table id {table_id:?} cannot be used as a file name"));
        }
        Ok(replica_file(&self.dir, table_id))
    }
}

#[async_trait]
impl ReplicaStore for FileReplicaStore {
    async fn load(&self, table_id: &str) -> anyhow::Result<Option<PersistedReplica>> {
        let path = self.path_for(table_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let replica = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(replica))
    }

    async fn save(&self, table_id: &str, replica: &PersistedReplica) -> anyhow::Result<()> {
        let path = self.path_for(table_id)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let bytes = serde_json::to_vec(replica).context("failed to serialize replica")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to move {} into place", tmp.display()))?;

        debug!(
            target: LOG_TARGET,
            table = table_id,
            entries = replica.log.len(),
            bytes = bytes.len(),
            "replica persisted"
        );
        Ok(())
    }
}

/// Store kept in process memory, for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemoryReplicaStore {
    replicas: DashMap<String, PersistedReplica>,
}

impl InMemoryReplicaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table_id: &str) -> Option<PersistedReplica> {
        self.replicas.get(table_id).map(|entry| entry.clone())
    }
}

#[async_trait]
impl ReplicaStore for InMemoryReplicaStore {
    async fn load(&self, table_id: &str) -> anyhow::Result<Option<PersistedReplica>> {
        Ok(self.get(table_id))
    }

    async fn save(&self, table_id: &str, replica: &PersistedReplica) -> anyhow::Result<()> {
        self.replicas.insert(table_id.to_string(), replica.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PersistedReplica {
        PersistedReplica {
            log: vec![
                LogEntry(0, json!({ "pot": 0 })),
                LogEntry(1, json!({ "pot": 5 })),
            ],
            current: Some(json!({ "pot": 5 })),
        }
    }

    #[tokio::test]
    async fn file_store_writes_and_reads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileReplicaStore::new(tmp.path().join("room-follower"));

        store.save("table-1", &sample()).await.unwrap();
        let loaded = store.load("table-1").await.unwrap();
        assert_eq!(loaded, Some(sample()));

        let raw = std::fs::read_to_string(tmp.path().join("room-follower/table-1.json")).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value,
            json!({ "log": [[0, { "pot": 0 }], [1, { "pot": 5 }]], "current": { "pot": 5 } })
        );
    }

    #[tokio::test]
    async fn missing_file_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileReplicaStore::new(tmp.path());
        assert_eq!(store.load("nobody").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("bad.json"), b"{ not json").unwrap();
        let store = FileReplicaStore::new(tmp.path());
        assert!(store.load("bad").await.is_err());
    }

    #[tokio::test]
    async fn path_like_table_ids_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileReplicaStore::new(tmp.path());
        assert!(store.save("../escape", &sample()).await.is_err());
        assert!(store.load("a/b").await.is_err());
        assert!(store.load("").await.is_err());
    }

    #[tokio::test]
    async fn in_memory_store_keeps_latest_copy() {
        let store = InMemoryReplicaStore::new();
        assert_eq!(store.load("t").await.unwrap(), None);
        store.save("t", &PersistedReplica::default()).await.unwrap();
        store.save("t", &sample()).await.unwrap();
        assert_eq!(store.get("t"), Some(sample()));
    }
}
