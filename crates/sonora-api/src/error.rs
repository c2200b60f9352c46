use thiserror::Error;

/// Top-level error type for the `sonora-api` crate.
///
/// Covers every failure mode of the raw wire layer: HTTP transport, relay
/// protocol validation, the SSE event stream, and the upstream websocket.
/// `sonora-core` maps these into caller-facing variants.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Relay protocol ──────────────────────────────────────────────
    /// The relay answered with a status code the endpoint never returns.
    #[error("Unexpected HTTP {status} from {endpoint}")]
    UnexpectedStatus { endpoint: &'static str, status: u16 },

    /// `GET /version` succeeded but carried no version header.
    #[error("Relay did not advertise a protocol version")]
    MissingVersion,

    /// The version header is present but is not `major.minor.patch`.
    #[error("Invalid relay version: {0}")]
    InvalidVersion(String),

    /// `POST /register` succeeded but carried no usable `Location` header.
    #[error("Relay registration returned no session location")]
    MissingLocation,

    /// A mutating endpoint answered 403: the session must be refreshed.
    #[error("Session authorization expired on {endpoint}")]
    Forbidden { endpoint: &'static str },

    // ── Data ────────────────────────────────────────────────────────
    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },

    /// The SSE event stream broke mid-flight.
    #[error("Event stream error: {0}")]
    EventStream(String),

    // ── Upstream websocket ──────────────────────────────────────────
    /// Websocket connection to the upstream device failed.
    #[error("Upstream connection failed: {0}")]
    WebSocketConnect(String),

    /// Websocket send failed after the connection was established.
    #[error("Upstream send failed: {0}")]
    WebSocketSend(String),
}

impl Error {
    /// Returns `true` if the relay rejected the call because the session
    /// needs refreshing.
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Returns `true` if the request never produced a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(e) if e.status().is_none())
    }

    /// Returns `true` for failures of the version/registration handshake.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::UnexpectedStatus { .. }
                | Self::MissingVersion
                | Self::InvalidVersion(_)
                | Self::MissingLocation
        )
    }
}
