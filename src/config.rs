use std::path::{Path, PathBuf};
use std::time::Duration;

use url::Url;

/// Directory under the storage root holding one replica file per table.
pub const REPLICA_DIR: &str = "room-follower";

/// Wire schema version carried by every action payload and `state` broadcast.
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Root directory; replica files live in `<storage_root>/room-follower/`.
    pub storage_root: PathBuf,
    /// Capacity of the per-table listener broadcast.
    pub broadcast_capacity: usize,
    /// Capacity of the request and response queues between owner and replica.
    pub request_capacity: usize,
    /// Supervised restarts allowed per table before the manager gives up.
    pub max_restarts: u32,
}

impl ReplicaConfig {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    pub fn replica_dir(&self) -> PathBuf {
        self.storage_root.join(REPLICA_DIR)
    }
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("."),
            broadcast_capacity: 256,
            request_capacity: 64,
            max_restarts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActionChannelConfig {
    /// How long to wait for an ack before retrying or giving up.
    pub ack_timeout: Duration,
    /// Retries used by the typed helpers when the caller does not pick one.
    pub default_retries: u32,
    pub protocol_version: u32,
    /// Capacity of the notice broadcast consumed by the UI.
    pub notice_capacity: usize,
}

impl Default for ActionChannelConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            default_retries: 1,
            protocol_version: PROTOCOL_VERSION,
            notice_capacity: 64,
        }
    }
}

/// Phoenix-protocol realtime endpoint used as the table broadcast bus.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub realtime_url: Url,
    pub api_key: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub broadcast_capacity: usize,
}

impl RealtimeConfig {
    pub fn new(realtime_url: Url, api_key: impl Into<String>) -> Self {
        Self {
            realtime_url,
            api_key: api_key.into(),
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(15),
            reconnect_delay: Duration::from_secs(5),
            broadcast_capacity: 256,
        }
    }

    /// Phoenix channel name for a bus topic.
    pub fn channel(&self, topic: &str) -> String {
        format!("realtime:{topic}")
    }
}

/// Websocket endpoint of the authority for the client action channel.
#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: Url,
    pub handshake_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Upper bound of the random jitter added to each reconnect delay.
    pub reconnect_jitter: Duration,
    pub event_capacity: usize,
}

impl WsTransportConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(1),
            reconnect_jitter: Duration::from_millis(500),
            event_capacity: 256,
        }
    }
}

/// Path of the persisted replica file for `table_id`.
pub fn replica_file(dir: &Path, table_id: &str) -> PathBuf {
    dir.join(format!("{table_id}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replica_files_live_under_room_follower() {
        let config = ReplicaConfig::new("/var/lib/tables");
        let path = replica_file(&config.replica_dir(), "t-42");
        assert_eq!(path, PathBuf::from("/var/lib/tables/room-follower/t-42.json"));
    }

    #[test]
    fn realtime_channel_prefixes_topic() {
        let url = Url::parse("wss://realtime.example.com/socket").unwrap();
        let config = RealtimeConfig::new(url, "anon");
        assert_eq!(config.channel("room:7:diffs"), "realtime:room:7:diffs");
    }
}
