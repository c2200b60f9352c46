// ── Relay error types ──
//
// Everything a relay operation can fail with. The HTTP layer maps each
// variant onto exactly one status code; 403 is reserved for "this client
// must refresh its session".

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    /// `start()` has not been called (or `stop()` has).
    #[error("Relay is not started")]
    NotStarted,

    /// The client id names no live session.
    #[error("Unknown client: {0}")]
    UnknownClient(String),

    /// The upstream device is not paired right now.
    #[error("Upstream device is not paired")]
    UpstreamUnavailable,

    /// The upstream connection dropped before answering.
    #[error("Upstream connection lost before reply")]
    UpstreamLost,

    /// The upstream device answered with an error.
    #[error("Upstream rejected request: {0}")]
    Upstream(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotStarted => StatusCode::SERVICE_UNAVAILABLE,
            Self::UnknownClient(_) => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable | Self::UpstreamLost | Self::Upstream(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}
