#![allow(clippy::unwrap_used)]
// Liveness-driven recovery against a relay stub that sends one heartbeat
// and then goes silent while keeping the event stream open.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::LOCATION;
use axum::response::IntoResponse;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use futures_util::{StreamExt, stream};
use tokio::net::TcpListener;
use url::Url;

use sonora_api::protocol::VERSION_HEADER;
use sonora_core::{Connection, ConnectionConfig, ConnectionStatus};

#[derive(Clone, Default)]
struct Stub {
    registrations: Arc<AtomicUsize>,
}

async fn version() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, [(VERSION_HEADER, "1.0.0")])
}

async fn register(State(stub): State<Stub>) -> impl IntoResponse {
    stub.registrations.fetch_add(1, Ordering::SeqCst);
    (StatusCode::CREATED, [(LOCATION, "/api/c1")])
}

async fn events() -> impl IntoResponse {
    let ping = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("ping").data(r#"{"interval_seconds":1}"#))
    });
    Sse::new(ping.chain(stream::pending()))
}

async fn spawn_stub() -> (Stub, Url) {
    let stub = Stub::default();
    let app = Router::new()
        .route("/api/version", get(version))
        .route("/api/register", post(register))
        .route("/api/register/{id}", post(register))
        .route("/api/c1/events", get(events))
        .route("/api/c1/unregister", post(|| async { StatusCode::NO_CONTENT }))
        .with_state(stub.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base_url = Url::parse(&format!("http://{}/api", listener.local_addr().unwrap())).unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (stub, base_url)
}

#[tokio::test]
async fn test_missed_heartbeat_refreshes_exactly_once() {
    let (stub, base_url) = spawn_stub().await;
    let connection = Connection::new(ConnectionConfig::new(base_url)).unwrap();
    assert_eq!(connection.start().await.unwrap(), "c1");
    assert!(!connection.is_stale());

    // One ping at 1s: silence for 1.5s expires the session.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !connection.is_stale() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(
        connection.status(),
        ConnectionStatus::Started {
            client_id: "c1".into()
        }
    );

    assert!(connection.refresh().await.unwrap());
    assert_eq!(stub.registrations.load(Ordering::SeqCst), 2);
    assert!(!connection.is_stale());

    assert!(!connection.refresh().await.unwrap());
    assert_eq!(stub.registrations.load(Ordering::SeqCst), 2);
    connection.stop().await;
}
