use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STATE_EVENT: &str = "state";
pub const SERVER_CLOCK_EVENT: &str = "server:Clock";
pub const RESUME_EVENT: &str = "resume";
pub const ACTION_ID_KEY: &str = "actionId";
pub const VERSION_KEY: &str = "version";

const ACK_SUFFIX: &str = ":ack";

/// Ack-gated events a seated client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Action,
    Join,
    BuyIn,
    SitOut,
    Rebuy,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        ActionKind::Action,
        ActionKind::Join,
        ActionKind::BuyIn,
        ActionKind::SitOut,
        ActionKind::Rebuy,
    ];

    pub fn event(self) -> &'static str {
        match self {
            ActionKind::Action => "action",
            ActionKind::Join => "join",
            ActionKind::BuyIn => "buy-in",
            ActionKind::SitOut => "sitout",
            ActionKind::Rebuy => "rebuy",
        }
    }

    pub fn ack_event(self) -> String {
        ack_event_for(self.event())
    }
}

pub fn ack_event_for(event: &str) -> String {
    format!("{event}{ACK_SUFFIX}")
}

/// One socket message: `{"event": <name>, "payload": <json>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// The `actionId` carried by an ack payload, if any.
    pub fn action_id(&self) -> Option<&str> {
        self.payload.get(ACTION_ID_KEY).and_then(Value::as_str)
    }
}

/// Authoritative table state pushed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub version: u32,
    pub tick: u64,
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub version: u32,
    /// `null` when no state has been accepted yet.
    pub tick: Option<u64>,
}

/// Server wall clock in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockMessage {
    pub now: i64,
}
