//! HTTP surface of the relay.
//!
//! | Method | Path | Success |
//! |---|---|---|
//! | GET  | `/version` | 204 + `x-sonora-version` |
//! | POST | `/register[/{previous}]` | 201 + `Location` |
//! | POST | `/{client_id}/unregister` | 204 |
//! | POST | `/{client_id}/command` | 202 `{command_id}` |
//! | POST | `/{client_id}/browse`, `/load` | 200 JSON |
//! | GET  | `/{client_id}/events` | SSE |
//!
//! Everything is nested under the configured base path.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use sonora_api::protocol::{ACCEL_BUFFERING_HEADER, VERSION_HEADER};
use sonora_api::{Command, CommandAccepted};

use crate::error::RelayError;
use crate::multiplexer::session_events;
use crate::session::SessionRegistry;

/// Version advertised on `GET /version`.
pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Normalized: empty, or `/segment` without a trailing slash.
    pub base_path: Arc<str>,
    pub heartbeat: Duration,
}

/// `"api/"` → `"/api"`, `"/"` → `""`.
pub fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

/// Build the full router with tracing and CORS layers.
pub fn build_router(state: AppState) -> Router {
    let base = state.base_path.to_string();
    let api = Router::new()
        .route("/version", get(version))
        .route("/register", post(register))
        .route("/register/{previous}", post(register_previous))
        .route("/{client_id}/unregister", post(unregister))
        .route("/{client_id}/command", post(command))
        .route("/{client_id}/browse", post(browse))
        .route("/{client_id}/load", post(load))
        .route("/{client_id}/events", get(events))
        .with_state(state);

    let router = if base.is_empty() {
        api
    } else {
        Router::new().nest(&base, api)
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn version() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(VERSION_HEADER, RELAY_VERSION)])
}

async fn register(State(state): State<AppState>) -> Result<Response, RelayError> {
    created(&state, None)
}

async fn register_previous(
    State(state): State<AppState>,
    Path(previous): Path<String>,
) -> Result<Response, RelayError> {
    created(&state, Some(&previous))
}

fn created(state: &AppState, previous: Option<&str>) -> Result<Response, RelayError> {
    let session = state.registry.register(previous)?;
    let location = format!("{}/{}", state.base_path, session.id());
    Ok((StatusCode::CREATED, [(header::LOCATION, location)]).into_response())
}

async fn unregister(State(state): State<AppState>, Path(client_id): Path<String>) -> StatusCode {
    state.registry.unregister(&client_id);
    StatusCode::NO_CONTENT
}

async fn command(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(command): Json<Command>,
) -> Result<(StatusCode, Json<CommandAccepted>), RelayError> {
    let command_id = state.registry.submit_command(&client_id, command)?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { command_id })))
}

async fn browse(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, RelayError> {
    state.registry.browse(&client_id, body).await.map(Json)
}

async fn load(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, RelayError> {
    state.registry.load(&client_id, body).await.map(Json)
}

async fn events(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> Result<impl IntoResponse, RelayError> {
    let session = state.registry.get(&client_id)?;
    let stream = session_events(Arc::clone(&state.registry), session, state.heartbeat)
        .filter_map(|event| async move {
            match event.data() {
                Ok(data) => Some(Ok::<_, Infallible>(Event::default().event(event.name()).data(data))),
                Err(e) => {
                    warn!(event = event.name(), error = %e, "dropping unserializable event");
                    None
                }
            }
        });
    Ok(([(ACCEL_BUFFERING_HEADER, "no")], Sse::new(stream)))
}
