//! Per-table replica of the authority's state log.
//!
//! Each table runs as its own supervised task that ingests `[index, state]`
//! broadcasts, keeps a tick-indexed log plus the current snapshot, persists
//! both for crash recovery and answers catch-up queries over message passing.
//! The replica is a cache: anything it loses can be rebuilt by pushing a fresh
//! snapshot from the authority.

pub mod actor;
pub mod log;
pub mod manager;
pub mod protocol;
pub mod store;

use thiserror::Error;

use crate::pubsub::PubSubError;

pub use actor::ReplicaHandle;
pub use log::{Applied, LogEntry, ReplicaLog};
pub use manager::ReplicaManager;
pub use protocol::{
    ReplicaEnvelope, ReplicaEvent, ReplicaRequest, ReplicaResponse, ReplicaUpdate, ResponseBody,
};
pub use store::{
    FileReplicaStore, InMemoryReplicaStore, PersistedReplica, ReplicaStore, SharedReplicaStore,
};

#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A broadcast did not decode as `[index, state]`.
    #[error("malformed broadcast for table {table_id}: {source}")]
    MalformedMessage {
        table_id: String,
        #[source]
        source: serde_json::Error,
    },

    /// The replica missed broadcasts and can no longer vouch for its log.
    #[error("replica for table {table_id} lagged behind its broadcast by {skipped} messages")]
    Lagged { table_id: String, skipped: u64 },

    #[error("broadcast for table {table_id} closed")]
    BroadcastClosed { table_id: String },

    #[error("failed to subscribe to {topic}: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: PubSubError,
    },

    #[error("replica for table {table_id} is not running")]
    Closed { table_id: String },

    #[error("unexpected response to {request} request")]
    UnexpectedResponse { request: &'static str },

    #[error("replica task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
