// ── Relay wire protocol ──
//
// Every payload that crosses the relay's HTTP/SSE surface, plus the
// constants both ends must share. Field names are the JSON names.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Response header carrying the relay protocol version on `GET /version`.
pub const VERSION_HEADER: &str = "x-sonora-version";

/// Response header that disables proxy buffering on the event stream.
pub const ACCEL_BUFFERING_HEADER: &str = "x-accel-buffering";

/// Period between two `ping` events on a session stream.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 45;

/// A session is considered stale after `interval × LIVENESS_TIMEOUT_FACTOR`
/// without a heartbeat.
pub const LIVENESS_TIMEOUT_FACTOR: f64 = 1.5;

/// Liveness deadline derived from an advertised heartbeat interval.
pub fn liveness_timeout(interval_seconds: u64) -> Duration {
    Duration::from_secs(interval_seconds).mul_f64(LIVENESS_TIMEOUT_FACTOR)
}

/// Validate a `major.minor.patch` version string (pre-release and build
/// suffixes are accepted and ignored).
pub fn validate_version(raw: &str) -> Result<(u64, u64, u64), Error> {
    let core = raw
        .split(['-', '+'])
        .next()
        .unwrap_or_default();
    let mut parts = core.split('.').map(str::parse::<u64>);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(Ok(major)), Some(Ok(minor)), Some(Ok(patch)), None) => Ok((major, minor, patch)),
        _ => Err(Error::InvalidVersion(raw.to_string())),
    }
}

// ── Commands ─────────────────────────────────────────────────────────

/// A state-changing request submitted by a client, forwarded verbatim to
/// the upstream device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub data: Value,
}

impl Command {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// Synchronous answer of `POST /{client_id}/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAccepted {
    pub command_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandState {
    Applied,
    Rejected,
}

/// Asynchronous outcome of a command, correlated by `command_id`.
/// One-shot: never replayed to late listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandNotification {
    pub command_id: String,
    pub state: CommandState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl CommandNotification {
    pub fn applied(command_id: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            state: CommandState::Applied,
            cause: None,
        }
    }

    pub fn rejected(command_id: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            state: CommandState::Rejected,
            cause: Some(cause.into()),
        }
    }
}

// ── Upstream aggregate state ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum UpstreamPhase {
    Starting,
    Syncing,
    Sync,
    Lost,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneDescription {
    pub zone_id: String,
    pub display_name: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescription {
    pub output_id: String,
    pub zone_id: String,
    pub display_name: String,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Process-wide view of the upstream link, latest value only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamState {
    pub state: UpstreamPhase,

    #[serde(default)]
    pub zones: Vec<ZoneDescription>,

    #[serde(default)]
    pub outputs: Vec<OutputDescription>,
}

impl UpstreamState {
    /// A state with no zones, used for every phase except `SYNC`.
    pub fn phase(state: UpstreamPhase) -> Self {
        Self {
            state,
            zones: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// `STOPPED` is terminal: it means shutdown and is never replayed.
    pub fn is_terminal(&self) -> bool {
        self.state == UpstreamPhase::Stopped
    }
}

// ── Per-zone state ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Playing,
    Paused,
    Loading,
    Stopped,
}

/// Latest known state of one zone, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    pub zone_id: String,
    pub display_name: String,
    pub state: PlaybackState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub now_playing: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek_position: Option<i64>,

    /// Everything else the device reports for the zone.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Latest known play queue of one zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    pub zone_id: String,

    #[serde(default)]
    pub items: Vec<Value>,

    #[serde(default)]
    pub total: usize,
}

// ── Shared configuration & heartbeat ─────────────────────────────────

/// Relay-wide settings pushed to every session, always in full.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(flatten)]
    pub settings: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub interval_seconds: u64,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval_seconds: HEARTBEAT_INTERVAL_SECS,
        }
    }
}

// ── Session event stream ─────────────────────────────────────────────

/// One named event on `GET /{client_id}/events`.
///
/// The SSE `event:` field carries [`RelayEvent::name`]; the `data:` field
/// carries the JSON of the inner payload.
#[derive(Debug, Clone, PartialEq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RelayEvent {
    State(UpstreamState),
    CommandState(CommandNotification),
    Zone(ZoneState),
    Queue(QueueState),
    Ping(Heartbeat),
    Config(SharedConfig),
}

impl RelayEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Serialize the payload for the SSE `data:` field.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::State(v) => serde_json::to_string(v),
            Self::CommandState(v) => serde_json::to_string(v),
            Self::Zone(v) => serde_json::to_string(v),
            Self::Queue(v) => serde_json::to_string(v),
            Self::Ping(v) => serde_json::to_string(v),
            Self::Config(v) => serde_json::to_string(v),
        }
    }

    /// Parse a named SSE event. Unknown names and malformed payloads are
    /// reported as [`Error::Deserialization`].
    pub fn parse(name: &str, data: &str) -> Result<Self, Error> {
        let parsed = match name {
            "state" => serde_json::from_str(data).map(Self::State),
            "command_state" => serde_json::from_str(data).map(Self::CommandState),
            "zone" => serde_json::from_str(data).map(Self::Zone),
            "queue" => serde_json::from_str(data).map(Self::Queue),
            "ping" => serde_json::from_str(data).map(Self::Ping),
            "config" => serde_json::from_str(data).map(Self::Config),
            other => {
                return Err(Error::Deserialization {
                    message: format!("unknown event '{other}'"),
                    body: data.to_string(),
                });
            }
        };
        parsed.map_err(|e| Error::Deserialization {
            message: format!("{name}: {e}"),
            body: data.to_string(),
        })
    }
}
