#![allow(clippy::unwrap_used)]
// Connection lifecycle against a wiremock relay.
//
// wiremock answers the event stream with a finite body, so every session's
// stream ends right after its scripted events; tests that need a
// long-lived stream live in `relay_roundtrip.rs`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sonora_api::protocol::VERSION_HEADER;
use sonora_api::{Command, RelayClient, ZoneState};
use sonora_core::{Connection, ConnectionConfig, ConnectionStatus, CoreError};

// ── Helpers ─────────────────────────────────────────────────────────

const PING: &str = "event: ping\ndata: {\"interval_seconds\":45}\n\n";

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/event-stream")
        .set_body_string(body)
}

fn connection(server: &MockServer) -> Connection {
    let base_url = Url::parse(&format!("{}/api", server.uri())).unwrap();
    let client = RelayClient::with_client(reqwest::Client::new(), base_url.clone());
    Connection::with_client(ConnectionConfig::new(base_url), client)
}

async fn mount_version(server: &MockServer, version: &str) {
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(204).insert_header(VERSION_HEADER, version))
        .mount(server)
        .await;
}

async fn mount_register(server: &MockServer, route: &str, client_id: &str) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(201).insert_header("location", format!("/api/{client_id}").as_str()),
        )
        .mount(server)
        .await;
}

async fn mount_events(server: &MockServer, client_id: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(format!("/api/{client_id}/events")))
        .respond_with(sse(body))
        .mount(server)
        .await;
}

/// Relay that accepts `c1` and streams a single ping.
async fn happy_relay() -> MockServer {
    let server = MockServer::start().await;
    mount_version(&server, "1.0.0").await;
    mount_register(&server, "/api/register", "c1").await;
    mount_register(&server, "/api/register/c1", "c1").await;
    mount_events(&server, "c1", PING.to_string()).await;
    server
}

fn record_status(connection: &Connection) -> Arc<Mutex<Vec<ConnectionStatus>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection.on_status(move |s| sink.lock().unwrap().push(s.clone()));
    seen
}

fn connection_with(server: &MockServer, tune: impl FnOnce(&mut ConnectionConfig)) -> Connection {
    let base_url = Url::parse(&format!("{}/api", server.uri())).unwrap();
    let mut config = ConnectionConfig::new(base_url.clone());
    tune(&mut config);
    Connection::with_client(config, RelayClient::with_client(reqwest::Client::new(), base_url))
}

async fn hits(server: &MockServer, prefix: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with(prefix))
        .count()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

// ── Start ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_publishes_started_with_client_id() {
    let server = happy_relay().await;
    let connection = connection(&server);
    let statuses = record_status(&connection);

    let client_id = connection.start().await.unwrap();

    assert_eq!(client_id, "c1");
    assert_eq!(connection.client_id().as_deref(), Some("c1"));
    assert_eq!(
        connection.status(),
        ConnectionStatus::Started {
            client_id: "c1".into()
        }
    );
    assert_eq!(
        statuses.lock().unwrap().as_slice(),
        &[ConnectionStatus::Started {
            client_id: "c1".into()
        }]
    );
}

#[tokio::test]
async fn test_start_reuses_configured_client_id() {
    let server = happy_relay().await;
    let base_url = Url::parse(&format!("{}/api", server.uri())).unwrap();
    let mut config = ConnectionConfig::new(base_url.clone());
    config.client_id = Some("c1".into());
    let connection =
        Connection::with_client(config, RelayClient::with_client(reqwest::Client::new(), base_url));

    connection.start().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().any(|r| r.url.path() == "/api/register/c1"));
    assert!(!requests.iter().any(|r| r.url.path() == "/api/register"));
}

#[tokio::test]
async fn test_version_failure_stops_before_register() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(201).insert_header("location", "/api/c1"))
        .expect(0)
        .mount(&server)
        .await;

    let connection = connection(&server);
    let statuses = record_status(&connection);
    let err = connection.start().await.unwrap_err();

    assert!(matches!(err, CoreError::Protocol { .. }), "got {err:?}");
    assert_eq!(connection.status(), ConnectionStatus::NotStarted);
    assert_eq!(statuses.lock().unwrap().as_slice(), &[ConnectionStatus::NotStarted]);
    assert!(connection.client_id().is_none());
}

#[tokio::test]
async fn test_register_failure_leaves_nothing_open() {
    let server = MockServer::start().await;
    mount_version(&server, "1.0.0").await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let connection = connection(&server);
    let err = connection.start().await.unwrap_err();

    assert!(matches!(err, CoreError::Protocol { .. }), "got {err:?}");
    assert!(connection.client_id().is_none());
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.iter().any(|r| r.url.path().ends_with("/events")));
}

#[tokio::test]
async fn test_event_stream_failure_unregisters_session() {
    let server = MockServer::start().await;
    mount_version(&server, "1.0.0").await;
    mount_register(&server, "/api/register", "c1").await;
    Mock::given(method("GET"))
        .and(path("/api/c1/events"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/c1/unregister"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection(&server);
    let err = connection.start().await.unwrap_err();

    assert!(err.is_session_expired(), "got {err:?}");
    assert_eq!(connection.status(), ConnectionStatus::NotStarted);
}

#[tokio::test]
async fn test_version_drift_publishes_outdated_and_resets_caches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(204).insert_header(VERSION_HEADER, "1.0.0"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_version(&server, "1.1.0").await;
    mount_register(&server, "/api/register", "c1").await;
    mount_register(&server, "/api/register/c1", "c1").await;
    let zone = "event: zone\ndata: {\"zone_id\":\"z1\",\"display_name\":\"Den\",\"state\":\"paused\"}\n\n";
    Mock::given(method("GET"))
        .and(path("/api/c1/events"))
        .respond_with(sse(zone.to_string()))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_events(&server, "c1", PING.to_string()).await;

    let connection = connection(&server);
    connection.start().await.unwrap();
    eventually(|| connection.listeners().zone("z1").is_some()).await;

    let statuses = record_status(&connection);
    connection.start().await.unwrap();

    assert_eq!(
        statuses.lock().unwrap().as_slice(),
        &[
            ConnectionStatus::Outdated,
            ConnectionStatus::Started {
                client_id: "c1".into()
            }
        ]
    );
    assert!(connection.listeners().zone("z1").is_none());
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn test_overlapping_restarts_cancel_the_older() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(
            ResponseTemplate::new(204)
                .insert_header(VERSION_HEADER, "1.0.0")
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;
    mount_register(&server, "/api/register", "c1").await;
    mount_events(&server, "c1", PING.to_string()).await;

    let connection = connection(&server);
    let (first, second) = tokio::join!(connection.restart(), connection.restart());

    assert!(first.unwrap_err().is_cancelled());
    assert_eq!(second.unwrap(), "c1");
}

#[tokio::test]
async fn test_superseded_fresh_registration_is_unregistered() {
    let server = MockServer::start().await;
    mount_version(&server, "1.0.0").await;
    Mock::given(method("POST"))
        .and(path("/api/register"))
        .respond_with(ResponseTemplate::new(201).insert_header("location", "/api/c1"))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_register(&server, "/api/register", "c2").await;
    Mock::given(method("GET"))
        .and(path("/api/c1/events"))
        .respond_with(sse(PING.to_string()).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;
    mount_events(&server, "c2", PING.to_string()).await;
    Mock::given(method("POST"))
        .and(path("/api/c1/unregister"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection(&server);
    let first = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.start().await })
    };
    // Let the first attempt register c1 and block on its event stream.
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(connection.start().await.unwrap(), "c2");
    assert!(first.await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(hits(&server, "/api/c1/unregister").await, 1);
    assert_eq!(connection.client_id().as_deref(), Some("c2"));
}

// ── Recovery ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_restart_retries_with_fixed_spacing_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_version(&server, "1.0.0").await;
    mount_register(&server, "/api/register", "c1").await;
    mount_events(&server, "c1", PING.to_string()).await;

    let connection = connection_with(&server, |c| c.restart_spacing = Duration::from_millis(100));
    let statuses = record_status(&connection);
    let began = tokio::time::Instant::now();

    assert_eq!(connection.restart().await.unwrap(), "c1");

    assert!(began.elapsed() >= Duration::from_millis(200));
    assert_eq!(hits(&server, "/api/version").await, 3);
    // Repeated failures announce NotStarted once.
    assert_eq!(
        statuses.lock().unwrap().as_slice(),
        &[
            ConnectionStatus::NotStarted,
            ConnectionStatus::Started {
                client_id: "c1".into()
            }
        ]
    );
}

#[tokio::test]
async fn test_failed_refresh_keeps_the_stale_mark() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/version"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let connection = connection(&server);
    connection.mark_stale();

    assert!(connection.refresh().await.is_err());
    assert!(connection.is_stale());
    assert_eq!(hits(&server, "/api/version").await, 1);
}

#[tokio::test]
async fn test_health_check_refreshes_only_while_visible() {
    let server = happy_relay().await;
    let connection =
        connection_with(&server, |c| c.health_check_period = Duration::from_millis(50));
    connection.start().await.unwrap();
    // The scripted stream ends after its ping, which marks the session stale.
    eventually(|| connection.is_stale()).await;

    let (visible, visible_rx) = tokio::sync::watch::channel(false);
    let health = connection.health_check(visible_rx);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(connection.is_stale());
    assert_eq!(hits(&server, "/api/register").await, 1);

    visible.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while hits(&server, "/api/register").await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    health.stop();
    eventually(|| health.is_finished()).await;
}

// ── Replay ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_zone_listener_attached_after_sync_sees_each_zone_once() {
    let server = MockServer::start().await;
    mount_version(&server, "1.0.0").await;
    mount_register(&server, "/api/register", "c1").await;
    let body = [
        PING,
        "event: state\ndata: {\"state\":\"SYNC\",\"zones\":[{\"zone_id\":\"z1\",\"display_name\":\"Den\"},{\"zone_id\":\"z2\",\"display_name\":\"Kitchen\"}],\"outputs\":[]}\n\n",
        "event: zone\ndata: {\"zone_id\":\"z1\",\"display_name\":\"Den\",\"state\":\"playing\"}\n\n",
        "event: zone\ndata: {\"zone_id\":\"z2\",\"display_name\":\"Kitchen\",\"state\":\"stopped\"}\n\n",
    ]
    .concat();
    mount_events(&server, "c1", body).await;

    let connection = connection(&server);
    assert_eq!(connection.start().await.unwrap(), "c1");
    eventually(|| connection.listeners().zones().len() == 2).await;

    let seen: Arc<Mutex<Vec<ZoneState>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    connection.on_zone(move |z| sink.lock().unwrap().push(z.clone()));

    let mut ids: Vec<String> = seen.lock().unwrap().iter().map(|z| z.zone_id.clone()).collect();
    ids.sort();
    assert_eq!(ids, vec!["z1", "z2"]);
}

// ── Mutating-call resilience ────────────────────────────────────────

#[tokio::test]
async fn test_command_403_refreshes_once_and_resends_identical_payload() {
    let server = happy_relay().await;
    let payload = json!({ "type": "PLAY_PAUSE", "data": { "zone_id": "z1" } });

    Mock::given(method("POST"))
        .and(path("/api/c1/command"))
        .and(body_json(payload.clone()))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/c1/command"))
        .and(body_json(payload))
        .respond_with(ResponseTemplate::new(202).set_body_json(json!({ "command_id": "cmd-1" })))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection(&server);
    connection.start().await.unwrap();

    let command_id = connection
        .command(&Command::new("PLAY_PAUSE", json!({ "zone_id": "z1" })))
        .await
        .unwrap();
    assert_eq!(command_id, "cmd-1");

    // One initial registration plus exactly one refresh.
    let registrations = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.url.path().starts_with("/api/register"))
        .count();
    assert_eq!(registrations, 2);
}

#[tokio::test]
async fn test_persistent_403_is_bounded() {
    let server = happy_relay().await;
    Mock::given(method("POST"))
        .and(path("/api/c1/browse"))
        .respond_with(ResponseTemplate::new(403))
        .expect(2)
        .mount(&server)
        .await;

    let connection = connection(&server);
    connection.start().await.unwrap();

    let err = connection
        .browse(&json!({ "hierarchy": "browse" }))
        .await
        .unwrap_err();
    assert!(
        matches!(err, CoreError::AuthorizationExpired { attempts: 2 }),
        "got {err:?}"
    );
}

#[tokio::test]
async fn test_transport_error_is_not_retried() {
    let server = happy_relay().await;
    Mock::given(method("POST"))
        .and(path("/api/c1/load"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection(&server);
    connection.start().await.unwrap();

    let err = connection.load(&json!({ "item_key": "k" })).await.unwrap_err();
    assert!(!matches!(err, CoreError::AuthorizationExpired { .. }));
}

// ── Stop ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_stop_unregisters_and_publishes_not_started() {
    let server = happy_relay().await;
    Mock::given(method("POST"))
        .and(path("/api/c1/unregister"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection(&server);
    connection.start().await.unwrap();
    connection.stop().await;

    assert_eq!(connection.status(), ConnectionStatus::NotStarted);
    assert!(connection.client_id().is_none());
}
