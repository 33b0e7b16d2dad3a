use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::actor::ReplicaHandle;
use super::protocol::ReplicaEvent;
use super::store::{FileReplicaStore, SharedReplicaStore};
use super::ReplicaError;
use crate::config::ReplicaConfig;
use crate::pubsub::PubSub;

const LOG_TARGET: &str = "tablesync::replica::manager";
const EVENT_CAPACITY: usize = 64;

/// Lifecycle manager running one supervised replica per table.
pub struct ReplicaManager {
    cfg: ReplicaConfig,
    store: SharedReplicaStore,
    bus: Arc<dyn PubSub>,
    replicas: DashMap<String, Arc<ReplicaHandle>>,
    events: broadcast::Sender<ReplicaEvent>,
}

impl ReplicaManager {
    pub fn new(cfg: ReplicaConfig, store: SharedReplicaStore, bus: Arc<dyn PubSub>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            cfg,
            store,
            bus,
            replicas: DashMap::new(),
            events,
        }
    }

    /// Manager persisting to `<storage_root>/room-follower/`.
    pub fn with_file_store(cfg: ReplicaConfig, bus: Arc<dyn PubSub>) -> Self {
        let store = Arc::new(FileReplicaStore::new(cfg.replica_dir()));
        Self::new(cfg, store, bus)
    }

    /// Starts the replica for `table_id`, or returns the one already running.
    /// A replica that gave up after exhausting its restarts is replaced.
    pub fn start(&self, table_id: &str) -> Arc<ReplicaHandle> {
        let mut entry = self
            .replicas
            .entry(table_id.to_string())
            .or_insert_with(|| {
                info!(target: LOG_TARGET, table = table_id, "starting replica");
                self.spawn(table_id)
            });
        if !entry.is_running() {
            info!(target: LOG_TARGET, table = table_id, "replacing stopped replica");
            *entry = self.spawn(table_id);
        }
        Arc::clone(entry.value())
    }

    fn spawn(&self, table_id: &str) -> Arc<ReplicaHandle> {
        Arc::new(ReplicaHandle::spawn(
            table_id,
            &self.cfg,
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.events.clone(),
        ))
    }

    pub fn get(&self, table_id: &str) -> Option<Arc<ReplicaHandle>> {
        self.replicas.get(table_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn tables(&self) -> Vec<String> {
        self.replicas.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Stops and forgets the replica for `table_id`. Returns `false` when no
    /// replica was running.
    pub async fn stop(&self, table_id: &str) -> Result<bool, ReplicaError> {
        let Some((_, handle)) = self.replicas.remove(table_id) else {
            return Ok(false);
        };
        info!(target: LOG_TARGET, table = table_id, "stopping replica");
        handle.shutdown().await?;
        Ok(true)
    }

    pub async fn shutdown(&self) {
        for table_id in self.tables() {
            if let Err(err) = self.stop(&table_id).await {
                warn!(target: LOG_TARGET, table = %table_id, error = %err, "replica ended with error");
            }
        }
    }

    /// Restart and failure notices for every managed table.
    pub fn events(&self) -> broadcast::Receiver<ReplicaEvent> {
        self.events.subscribe()
    }
}
