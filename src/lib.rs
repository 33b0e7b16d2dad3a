pub mod channel;
pub mod config;
pub mod delta;
pub mod pubsub;
pub mod replica;
pub mod tokio_tools;

pub use channel::{ActionChannel, ActionError, ActionKind, ChannelNotice};
pub use config::{ActionChannelConfig, RealtimeConfig, ReplicaConfig, WsTransportConfig};
pub use delta::{apply_delta, compute_delta};
pub use replica::{ReplicaError, ReplicaHandle, ReplicaManager};
