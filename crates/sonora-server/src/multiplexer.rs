// ── Per-session event multiplexer ──
//
// Merges four sources into one outbound stream for a session:
//   1. command results from the session's own channel (never replayed)
//   2. the shared config (latest value replayed)
//   3. aggregate upstream state, zones and queues (replayed per key)
//   4. a heartbeat, first tick immediately on attach
//
// No order is promised across sources. Dropping the stream detaches the
// session exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use sonora_api::{Heartbeat, RelayEvent};

use crate::hub::KeyedUpdate;
use crate::session::{Session, SessionRegistry};

/// Unregisters the session when the stream that owns it is dropped,
/// unless a newer registration took the session over.
struct DetachGuard {
    registry: Arc<SessionRegistry>,
    client_id: String,
    epoch: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        debug!(client_id = %self.client_id, "event stream closed");
        self.registry.detach(&self.client_id, self.epoch);
    }
}

/// Build the outbound event stream for `session`.
pub fn session_events(
    registry: Arc<SessionRegistry>,
    session: Arc<Session>,
    heartbeat: Duration,
) -> impl Stream<Item = RelayEvent> + Send + 'static {
    let hub = Arc::clone(registry.hub());
    let guard = DetachGuard {
        registry,
        client_id: session.id().to_string(),
        epoch: session.epoch(),
    };
    let ping = Heartbeat {
        interval_seconds: heartbeat.as_secs(),
    };

    // Subscribe eagerly, before the response is sent and before replay, so
    // nothing published in between is lost.
    let mut commands = session.subscribe_commands();
    let closed = session.closed();
    let mut state_rx = hub.state.subscribe();
    let mut config_rx = hub.config.subscribe();
    let (zones, mut zone_rx) = hub.zones.subscribe();
    let (queues, mut queue_rx) = hub.queues.subscribe();

    async_stream::stream! {
        let _guard = guard;

        let state = Arc::clone(&*state_rx.borrow_and_update());
        if !state.is_terminal() {
            yield RelayEvent::State((*state).clone());
        }
        let config = Arc::clone(&*config_rx.borrow_and_update());
        yield RelayEvent::Config((*config).clone());
        for zone in zones {
            yield RelayEvent::Zone((*zone).clone());
        }
        for queue in queues {
            yield RelayEvent::Queue((*queue).clone());
        }

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let batch: Vec<RelayEvent> = tokio::select! {
                biased;
                () = closed.cancelled() => break,
                _ = ticker.tick() => vec![RelayEvent::Ping(ping)],
                result = commands.recv() => match result {
                    Ok(notification) => vec![RelayEvent::CommandState(notification)],
                    Err(RecvError::Lagged(n)) => {
                        warn!(client_id = %session.id(), skipped = n, "command results lagged");
                        Vec::new()
                    }
                    Err(RecvError::Closed) => break,
                },
                changed = state_rx.changed() => match changed {
                    Ok(()) => {
                        let state = Arc::clone(&*state_rx.borrow_and_update());
                        vec![RelayEvent::State((*state).clone())]
                    }
                    Err(_) => break,
                },
                changed = config_rx.changed() => match changed {
                    Ok(()) => {
                        let config = Arc::clone(&*config_rx.borrow_and_update());
                        vec![RelayEvent::Config((*config).clone())]
                    }
                    Err(_) => break,
                },
                update = zone_rx.recv() => match update {
                    Ok(KeyedUpdate::Upserted(zone)) => vec![RelayEvent::Zone((*zone).clone())],
                    // Removals reach clients through the re-published zone listing.
                    Ok(KeyedUpdate::Removed(zone_id)) => {
                        debug!(zone_id, "zone removed");
                        Vec::new()
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(client_id = %session.id(), skipped = n, "zone updates lagged, resending snapshot");
                        let (snapshot, rx) = hub.zones.subscribe();
                        zone_rx = rx;
                        snapshot.iter().map(|z| RelayEvent::Zone((**z).clone())).collect()
                    }
                    Err(RecvError::Closed) => break,
                },
                update = queue_rx.recv() => match update {
                    Ok(KeyedUpdate::Upserted(queue)) => vec![RelayEvent::Queue((*queue).clone())],
                    Ok(KeyedUpdate::Removed(_)) => Vec::new(),
                    Err(RecvError::Lagged(n)) => {
                        warn!(client_id = %session.id(), skipped = n, "queue updates lagged, resending snapshot");
                        let (snapshot, rx) = hub.queues.subscribe();
                        queue_rx = rx;
                        snapshot.iter().map(|q| RelayEvent::Queue((**q).clone())).collect()
                    }
                    Err(RecvError::Closed) => break,
                },
            };
            for event in batch {
                yield event;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::hub::UpstreamHub;
    use crate::link::{BackoffPolicy, UpstreamLink};
    use futures_util::StreamExt;
    use futures_util::pin_mut;
    use serde_json::Value;
    use sonora_api::{
        CommandNotification, PlaybackState, UpstreamPhase, UpstreamState, ZoneState,
    };
    use url::Url;

    const HEARTBEAT: Duration = Duration::from_secs(45);

    fn started_registry() -> Arc<SessionRegistry> {
        let link = UpstreamLink::new(
            Url::parse("ws://127.0.0.1:9/").unwrap(),
            BackoffPolicy::default(),
            Arc::new(UpstreamHub::default()),
        );
        let registry = Arc::new(SessionRegistry::new(link));
        registry.start();
        registry
    }

    fn zone(id: &str, state: PlaybackState) -> ZoneState {
        ZoneState {
            zone_id: id.into(),
            display_name: id.to_uppercase(),
            state,
            now_playing: None,
            seek_position: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_latest_state_config_and_zones_then_pings() {
        let registry = started_registry();
        let hub = Arc::clone(registry.hub());
        hub.state.publish(UpstreamState::phase(UpstreamPhase::Syncing));
        hub.state.publish(UpstreamState {
            state: UpstreamPhase::Sync,
            zones: Vec::new(),
            outputs: Vec::new(),
        });
        hub.zones.publish("z1", zone("z1", PlaybackState::Playing));

        let session = registry.register(None).unwrap();
        let events = session_events(Arc::clone(&registry), session, HEARTBEAT);
        pin_mut!(events);

        assert!(matches!(events.next().await, Some(RelayEvent::State(s)) if s.state == UpstreamPhase::Sync));
        assert!(matches!(events.next().await, Some(RelayEvent::Config(_))));
        assert!(matches!(events.next().await, Some(RelayEvent::Zone(z)) if z.zone_id == "z1"));
        assert!(matches!(events.next().await, Some(RelayEvent::Ping(hb)) if hb.interval_seconds == 45));
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_state_is_not_replayed() {
        let registry = started_registry();
        registry.hub().set_phase(UpstreamPhase::Stopped);

        let session = registry.register(None).unwrap();
        let events = session_events(Arc::clone(&registry), session, HEARTBEAT);
        pin_mut!(events);

        assert!(matches!(events.next().await, Some(RelayEvent::Config(_))));
        assert!(matches!(events.next().await, Some(RelayEvent::Ping(_))));
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn command_results_are_not_replayed() {
        let registry = started_registry();
        let session = registry.register(None).unwrap();

        // Issued before anyone listens: must not show up later.
        registry
            .submit_command(session.id(), sonora_api::Command::new("PLAY", Value::Null))
            .unwrap();

        let events = session_events(Arc::clone(&registry), Arc::clone(&session), HEARTBEAT);
        pin_mut!(events);
        // state (STARTING), config, ping
        for _ in 0..3 {
            let event = events.next().await.unwrap();
            assert!(!matches!(event, RelayEvent::CommandState(_)), "replayed {event:?}");
        }
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn live_command_result_reaches_only_its_session() {
        let registry = started_registry();
        let mine = registry.register(None).unwrap();
        let theirs = registry.register(None).unwrap();

        let events = session_events(Arc::clone(&registry), Arc::clone(&mine), HEARTBEAT);
        pin_mut!(events);
        for _ in 0..3 {
            events.next().await.unwrap();
        }

        let command_id = registry
            .submit_command(mine.id(), sonora_api::Command::new("STOP", Value::Null))
            .unwrap();
        let mut other = theirs.subscribe_commands();

        match events.next().await.unwrap() {
            RelayEvent::CommandState(CommandNotification { command_id: id, .. }) => {
                assert_eq!(id, command_id);
            }
            other => panic!("expected command_state, got {other:?}"),
        }
        assert!(other.try_recv().is_err());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_stream_unregisters_once() {
        let registry = started_registry();
        let session = registry.register(None).unwrap();
        let id = session.id().to_string();

        let events = session_events(Arc::clone(&registry), session, HEARTBEAT);
        drop(events);

        assert!(registry.get(&id).is_err());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_superseded_stream_keeps_the_session() {
        let registry = started_registry();
        let session = registry.register(None).unwrap();
        let old = session_events(Arc::clone(&registry), Arc::clone(&session), HEARTBEAT);

        registry.register(Some(session.id())).unwrap();
        drop(old);

        assert!(registry.get(session.id()).is_ok());
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn lagging_session_gets_a_fresh_zone_snapshot() {
        let registry = started_registry();
        let hub = Arc::clone(registry.hub());
        let session = registry.register(None).unwrap();
        let events = session_events(Arc::clone(&registry), session, HEARTBEAT);
        pin_mut!(events);

        // Overflow the zone channel before the stream is polled: the lone
        // z2 update falls out of the buffer.
        hub.zones.publish("z2", zone("z2", PlaybackState::Paused));
        for _ in 0..300 {
            hub.zones.publish("z1", zone("z1", PlaybackState::Playing));
        }

        let mut saw_z2 = false;
        for _ in 0..10 {
            match events.next().await {
                Some(RelayEvent::Zone(z)) if z.zone_id == "z2" => {
                    assert_eq!(z.state, PlaybackState::Paused);
                    saw_z2 = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_z2, "z2 never reached the session");
        registry.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn unregister_ends_the_stream() {
        let registry = started_registry();
        let session = registry.register(None).unwrap();
        let events = session_events(Arc::clone(&registry), Arc::clone(&session), HEARTBEAT);
        pin_mut!(events);
        for _ in 0..3 {
            events.next().await.unwrap();
        }

        registry.unregister(session.id());
        assert!(events.next().await.is_none());
        registry.stop();
    }
}
