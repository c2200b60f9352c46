#![allow(clippy::unwrap_used)]
// Upstream link against an in-process fake device speaking the websocket
// protocol.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt, pin_mut};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};
use url::Url;

use sonora_api::{CommandState, RelayEvent, UpstreamPhase};
use sonora_server::multiplexer::session_events;
use sonora_server::{BackoffPolicy, LinkState, Relay, RelayConfig};

const WAIT: Duration = Duration::from_secs(5);

type Device = WebSocketStream<TcpStream>;

async fn fake_device() -> (TcpListener, Url) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("ws://{}/", listener.local_addr().unwrap())).unwrap();
    (listener, url)
}

async fn accept(listener: &TcpListener) -> Device {
    let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    accept_async(stream).await.unwrap()
}

async fn send(device: &mut Device, message: Value) {
    device.send(Message::text(message.to_string())).await.unwrap();
}

async fn recv(device: &mut Device) -> Value {
    loop {
        match timeout(WAIT, device.next()).await.unwrap().unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn relay_for(url: Url) -> Relay {
    let mut config = RelayConfig::new(url);
    config.backoff = BackoffPolicy {
        min_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(200),
        max_jitter: Duration::from_millis(5),
    };
    Relay::new(&config)
}

async fn pair(device: &mut Device) {
    send(device, json!({ "type": "paired", "core_id": "core-1", "display_name": "Den Core" })).await;
    send(
        device,
        json!({
            "type": "zones",
            "zones": [{ "zone_id": "z1", "display_name": "Den" }],
            "outputs": []
        }),
    )
    .await;
}

async fn wait_for_phase(relay: &Relay, phase: UpstreamPhase) {
    let mut rx = relay.registry().hub().state.subscribe();
    timeout(WAIT, rx.wait_for(|state| state.state == phase))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_pairing_and_zone_listing_reach_the_hub() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    pair(&mut device).await;
    send(
        &mut device,
        json!({
            "type": "zone_changed",
            "zone": { "zone_id": "z1", "display_name": "Den", "state": "playing" }
        }),
    )
    .await;

    wait_for_phase(&relay, UpstreamPhase::Sync).await;
    let hub = relay.registry().hub();
    timeout(WAIT, async {
        while hub.zones.get("z1").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(hub.state.current().zones.len(), 1);
    assert_eq!(relay.registry().link().state(), LinkState::Paired);
    relay.stop();
}

#[tokio::test]
async fn test_command_result_flows_back_to_issuing_session() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    pair(&mut device).await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;

    let registry = Arc::clone(relay.registry());
    let session = registry.register(None).unwrap();
    let events = session_events(Arc::clone(&registry), Arc::clone(&session), Duration::from_secs(45));
    pin_mut!(events);
    // state, config, ping
    for _ in 0..3 {
        timeout(WAIT, events.next()).await.unwrap().unwrap();
    }

    let command_id = registry
        .submit_command(session.id(), sonora_api::Command::new("PLAY", json!({ "zone_id": "z1" })))
        .unwrap();

    let request = recv(&mut device).await;
    assert_eq!(request["type"], "command");
    assert_eq!(request["session_id"], session.id());
    assert_eq!(request["command"]["type"], "PLAY");
    send(
        &mut device,
        json!({ "type": "reply", "request_id": request["request_id"], "ok": true }),
    )
    .await;

    let event = timeout(WAIT, async {
        loop {
            match events.next().await.unwrap() {
                RelayEvent::CommandState(n) => return n,
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(event.command_id, command_id);
    assert_eq!(event.state, CommandState::Applied);
    relay.stop();
}

#[tokio::test]
async fn test_browse_round_trip_and_upstream_error() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    pair(&mut device).await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;

    let registry = Arc::clone(relay.registry());
    let session = registry.register(None).unwrap();
    let id = session.id().to_string();

    let browse = tokio::spawn({
        let registry = Arc::clone(&registry);
        let id = id.clone();
        async move { registry.browse(&id, json!({ "hierarchy": "browse" })).await }
    });
    let request = recv(&mut device).await;
    assert_eq!(request["type"], "browse");
    send(
        &mut device,
        json!({ "type": "reply", "request_id": request["request_id"], "ok": true, "body": { "list": { "count": 2 } } }),
    )
    .await;
    let body = timeout(WAIT, browse).await.unwrap().unwrap().unwrap();
    assert_eq!(body["list"]["count"], 2);

    let load = tokio::spawn({
        let registry = Arc::clone(&registry);
        async move { registry.load(&id, json!({ "item_key": "x" })).await }
    });
    let request = recv(&mut device).await;
    send(
        &mut device,
        json!({ "type": "reply", "request_id": request["request_id"], "ok": false, "error": "no such item" }),
    )
    .await;
    let err = timeout(WAIT, load).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.status(), axum::http::StatusCode::BAD_GATEWAY);
    relay.stop();
}

#[tokio::test]
async fn test_lost_device_is_reconnected_with_backoff() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    pair(&mut device).await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;

    device.close(None).await.unwrap();
    drop(device);
    wait_for_phase(&relay, UpstreamPhase::Lost).await;

    // The link comes back on its own.
    let mut device = accept(&listener).await;
    pair(&mut device).await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;
    relay.stop();
}

#[tokio::test]
async fn test_zone_removal_republishes_listing_without_the_zone() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    send(&mut device, json!({ "type": "paired", "core_id": "core-1", "display_name": "Den Core" })).await;
    send(
        &mut device,
        json!({
            "type": "zones",
            "zones": [
                { "zone_id": "z1", "display_name": "Den" },
                { "zone_id": "z2", "display_name": "Kitchen" }
            ],
            "outputs": [
                { "output_id": "o1", "zone_id": "z1", "display_name": "Den Amp" },
                { "output_id": "o2", "zone_id": "z2", "display_name": "Kitchen Amp" }
            ]
        }),
    )
    .await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;

    let mut rx = relay.registry().hub().state.subscribe();
    send(&mut device, json!({ "type": "zone_removed", "zone_id": "z2" })).await;
    let listing = timeout(WAIT, rx.wait_for(|state| state.zones.len() == 1))
        .await
        .unwrap()
        .unwrap()
        .clone();

    assert_eq!(listing.state, UpstreamPhase::Sync);
    assert_eq!(listing.zones[0].zone_id, "z1");
    assert_eq!(listing.outputs.len(), 1);
    assert_eq!(listing.outputs[0].output_id, "o1");
    assert!(relay.registry().hub().zones.get("z2").is_none());
    relay.stop();
}

#[tokio::test]
async fn test_unregister_releases_device_session() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();

    let mut device = accept(&listener).await;
    pair(&mut device).await;
    wait_for_phase(&relay, UpstreamPhase::Sync).await;

    let session = relay.registry().register(None).unwrap();
    relay.registry().unregister(session.id());

    let request = recv(&mut device).await;
    assert_eq!(request["type"], "release_session");
    assert_eq!(request["session_id"], session.id());
    relay.stop();
}

#[tokio::test]
async fn test_stop_publishes_stopped() {
    let (listener, url) = fake_device().await;
    let relay = relay_for(url);
    relay.start();
    let _device = accept(&listener).await;

    relay.stop();
    assert_eq!(
        relay.registry().hub().state.current().state,
        UpstreamPhase::Stopped
    );
}
