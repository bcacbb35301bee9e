//! Gateway wire protocol definitions.
//!
//! API version 10, JSON encoding. Every frame is a [`Payload`]:
//! `{ "op": int, "d": any, "s": int|null, "t": string|null }`.
//!
//! Frames of interest:
//! - `Hello`: first frame after connecting, carries the heartbeat interval
//! - `Identify` / `Resume`: start a fresh session or reattach to one
//! - `Dispatch`: server-push event, sequenced by `s` and named by `t`
//! - `Heartbeat` / `HeartbeatAck`: application-level liveness

pub mod close_code;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use close_code::{CloseCode, classify};

// ── Constants ────────────────────────────────────────────────────────────────

pub const API_VERSION: u8 = 10;
pub const ENCODING: &str = "json";
/// Gateway commands allowed per connection per [`COMMAND_WINDOW`].
pub const COMMAND_LIMIT: i64 = 120;
pub const COMMAND_WINDOW: Duration = Duration::from_secs(60);
/// Window of the identify concurrency bucket.
pub const IDENTIFY_WINDOW: Duration = Duration::from_secs(5);
/// Close code the client sends when it closes in order to reconnect.
pub const RECONNECT_CLOSE_CODE: u16 = 3000;

// ── Opcodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    VoiceStateUpdate,
    Resume,
    Reconnect,
    RequestGuildMembers,
    InvalidSession,
    Hello,
    HeartbeatAck,
    Unknown(u8),
}

impl From<u8> for Opcode {
    fn from(op: u8) -> Self {
        match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            8 => Self::RequestGuildMembers,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            other => Self::Unknown(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        match op {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::VoiceStateUpdate => 4,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::RequestGuildMembers => 8,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::Unknown(other) => other,
        }
    }
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// A single gateway frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub op: Opcode,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Payload {
    /// Client → server command frame.
    pub fn command<T: Serialize>(op: Opcode, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            op,
            d: Some(serde_json::to_value(data)?),
            s: None,
            t: None,
        })
    }

    /// Heartbeat carrying the last sequence number received (null when none).
    pub fn heartbeat(seq: Option<u64>) -> Self {
        Self {
            op: Opcode::Heartbeat,
            d: seq.map(serde_json::Value::from),
            s: None,
            t: None,
        }
    }

    /// Decode `d` into `T`, treating a missing `d` as JSON null.
    pub fn data<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.d.clone().unwrap_or(serde_json::Value::Null))
    }

    /// Event name of a dispatch frame.
    pub fn event_name(&self) -> Option<&str> {
        self.t.as_deref()
    }
}

/// A dispatched event handed to the event layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    pub sequence: Option<u64>,
    pub data: serde_json::Value,
}

impl Event {
    pub fn from_payload(payload: Payload) -> Option<Self> {
        if payload.op != Opcode::Dispatch {
            return None;
        }
        Some(Self {
            name: payload.t?,
            sequence: payload.s,
            data: payload.d.unwrap_or(serde_json::Value::Null),
        })
    }
}

// ── Dispatch names ───────────────────────────────────────────────────────────

pub mod events {
    pub const READY: &str = "READY";
    pub const RESUMED: &str = "RESUMED";
}

// ── Payload data ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

impl Hello {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}

/// The subset of the `READY` dispatch the session needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub session_id: String,
    pub resume_gateway_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "ferrule".to_string(),
            device: "ferrule".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identify {
    pub token: String,
    pub intents: u64,
    pub properties: IdentifyProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub since: Option<u64>,
    pub activities: Vec<serde_json::Value>,
    pub status: String,
    pub afk: bool,
}

/// `GET /gateway/bot` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayBot {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    /// Milliseconds until `remaining` resets.
    pub reset_after: u64,
    pub max_concurrency: u32,
}
