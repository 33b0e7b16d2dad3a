use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::log::LogEntry;

/// Query sent to a replica by its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplicaRequest {
    /// Bulk-replace the log with an ordered list of entries.
    Snapshot { log: Vec<LogEntry> },
    GetState,
    /// Entries with `index >= from`.
    Resume { from: u64 },
    /// Current state only; historical replay belongs to the authority.
    Replay,
    Ping,
}

impl ReplicaRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot { .. } => "snapshot",
            Self::GetState => "getState",
            Self::Resume { .. } => "resume",
            Self::Replay => "replay",
            Self::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaEnvelope {
    pub seq: u64,
    #[serde(flatten)]
    pub request: ReplicaRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Ok { ok: bool },
    State { state: Option<Value> },
    States { states: Vec<LogEntry> },
}

impl ResponseBody {
    pub fn ok() -> Self {
        Self::Ok { ok: true }
    }
}

/// Response correlated to its request by `seq`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaResponse {
    pub seq: u64,
    #[serde(flatten)]
    pub body: ResponseBody,
}

/// Update forwarded to local listeners after a broadcast message is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicaUpdate {
    pub index: u64,
    pub state: Value,
    /// Delta from the previous current state when this update advanced it;
    /// `None` for a late entry that only filled an older slot.
    pub delta: Option<Value>,
}

/// Lifecycle notices from a supervised replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaEvent {
    /// The replica failed and was rebuilt from its persisted copy; the owner
    /// should push a fresh snapshot.
    Restarted {
        table_id: String,
        attempt: u32,
        reason: String,
    },
    /// Restart budget exhausted; the replica is gone.
    Failed { table_id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn requests_use_camel_case_tags() {
        let envelope = ReplicaEnvelope {
            seq: 4,
            request: ReplicaRequest::Resume { from: 12 },
        };
        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({ "seq": 4, "type": "resume", "from": 12 })
        );

        let parsed: ReplicaEnvelope =
            serde_json::from_value(json!({ "seq": 9, "type": "getState" })).unwrap();
        assert_eq!(parsed.request, ReplicaRequest::GetState);

        let parsed: ReplicaEnvelope = serde_json::from_value(
            json!({ "seq": 1, "type": "snapshot", "log": [[0, { "pot": 0 }]] }),
        )
        .unwrap();
        assert_eq!(
            parsed.request,
            ReplicaRequest::Snapshot {
                log: vec![LogEntry(0, json!({ "pot": 0 }))]
            }
        );
    }

    #[test]
    fn responses_echo_seq() {
        let ok = ReplicaResponse {
            seq: 3,
            body: ResponseBody::ok(),
        };
        assert_eq!(serde_json::to_value(&ok).unwrap(), json!({ "seq": 3, "ok": true }));

        let state = ReplicaResponse {
            seq: 5,
            body: ResponseBody::State { state: None },
        };
        assert_eq!(
            serde_json::to_value(&state).unwrap(),
            json!({ "seq": 5, "state": null })
        );

        let states = ReplicaResponse {
            seq: 6,
            body: ResponseBody::States {
                states: vec![LogEntry(1, json!({ "pot": 5 }))],
            },
        };
        assert_eq!(
            serde_json::to_value(&states).unwrap(),
            json!({ "seq": 6, "states": [[1, { "pot": 5 }]] })
        );
    }
}
