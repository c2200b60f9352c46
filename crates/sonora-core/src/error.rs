// ── Core error types ──
//
// User-facing errors from sonora-core. Callers never see raw HTTP status
// codes; the `From<sonora_api::Error>` impl sorts transport failures,
// protocol violations and expired sessions into their own variants.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to relay at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Relay request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The relay answered, but not the way the protocol says it must.
    #[error("Protocol violation: {message}")]
    Protocol { message: String },

    #[error("Event stream failed: {message}")]
    EventStream { message: String },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Connection is not started")]
    NotStarted,

    /// A newer `restart()` superseded this attempt.
    #[error("Connection attempt cancelled by a newer restart")]
    Cancelled,

    // ── Session errors ───────────────────────────────────────────────
    /// The relay no longer recognises this client (HTTP 403).
    #[error("Session expired on {endpoint}")]
    SessionExpired { endpoint: &'static str },

    /// Still 403 after refreshing the session the allowed number of times.
    #[error("Authorization still expired after {attempts} attempt(s)")]
    AuthorizationExpired { attempts: u32 },

    // ── Command errors ───────────────────────────────────────────────
    #[error("Command {command_id} rejected: {cause}")]
    CommandRejected { command_id: String, cause: String },

    #[error("API error: {message}")]
    Api {
        message: String,
        status: Option<u16>,
    },

    // ── Configuration errors ─────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// True for a superseded attempt, as opposed to a failed one.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<sonora_api::Error> for CoreError {
    fn from(err: sonora_api::Error) -> Self {
        match err {
            sonora_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map_or_else(|| "<unknown>".into(), ToString::to_string),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Api {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            sonora_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("Invalid URL: {e}"),
            },
            sonora_api::Error::UnexpectedStatus { endpoint, status } => CoreError::Protocol {
                message: format!("{endpoint} answered with HTTP {status}"),
            },
            sonora_api::Error::MissingVersion => CoreError::Protocol {
                message: "version response has no version header".into(),
            },
            sonora_api::Error::InvalidVersion(raw) => CoreError::Protocol {
                message: format!("invalid relay version '{raw}'"),
            },
            sonora_api::Error::MissingLocation => CoreError::Protocol {
                message: "register response has no Location header".into(),
            },
            sonora_api::Error::Forbidden { endpoint } => CoreError::SessionExpired { endpoint },
            sonora_api::Error::Deserialization { message, body: _ } => {
                CoreError::Internal(format!("Deserialization error: {message}"))
            }
            sonora_api::Error::EventStream(message) => CoreError::EventStream { message },
            sonora_api::Error::WebSocketConnect(reason) | sonora_api::Error::WebSocketSend(reason) => {
                CoreError::ConnectionFailed {
                    url: String::new(),
                    reason,
                }
            }
        }
    }
}
