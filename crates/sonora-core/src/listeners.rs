//! Typed listener registry with replay-on-attach.
//!
//! | Kind | Replayed on attach | Forwarded |
//! |---|---|---|
//! | upstream state | latest, unless `STOPPED`; `STARTING` if nothing yet | yes |
//! | zone / queue | once per known key | yes |
//! | command result | no | yes |
//! | connection status | no | yes |
//! | shared config | latest full snapshot | yes |
//!
//! Dispatch is synchronous. Listeners are cloned out of the lock before
//! they run, so a listener may (un)subscribe from inside its own callback.
//! Values dispatched while a new listener is still replaying are held for
//! it and delivered after the replay, never before.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sonora_api::{
    CommandNotification, QueueState, RelayEvent, SharedConfig, UpstreamPhase, UpstreamState,
    ZoneState,
};

use crate::connection::ConnectionStatus;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Opaque handle returned by every `on_*` registration. Pass it back to
/// [`ListenerRegistry::unsubscribe`] to revoke that one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

struct Entry<T> {
    id: u64,
    listener: Listener<T>,
    /// `Some` while the attach replay runs: live values queue up here.
    held: Option<Vec<T>>,
}

struct ListenerSet<T> {
    entries: Vec<Entry<T>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> ListenerSet<T> {
    fn push(&mut self, id: u64, listener: Listener<T>) {
        self.entries.push(Entry {
            id,
            listener,
            held: None,
        });
    }

    fn remove(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Listener<T>> {
        self.entries.iter().map(|e| Arc::clone(&e.listener)).collect()
    }
}

impl<T: Clone> ListenerSet<T> {
    /// Listeners to call with `value` now. Listeners still replaying get
    /// a copy queued instead.
    fn deliver(&mut self, value: &T) -> Vec<Listener<T>> {
        let mut ready = Vec::with_capacity(self.entries.len());
        for entry in &mut self.entries {
            match &mut entry.held {
                Some(held) => held.push(value.clone()),
                None => ready.push(Arc::clone(&entry.listener)),
            }
        }
        ready
    }

    /// Drain what was queued for `id`. Returns `None`, and ends the replay
    /// phase, once nothing is left or the listener is gone.
    fn take_held(&mut self, id: u64) -> Option<Vec<T>> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        let held = entry.held.take()?;
        if held.is_empty() {
            return None;
        }
        entry.held = Some(Vec::new());
        Some(held)
    }
}

#[derive(Default)]
struct Listeners {
    state: ListenerSet<UpstreamState>,
    zone: ListenerSet<ZoneState>,
    queue: ListenerSet<QueueState>,
    command: ListenerSet<CommandNotification>,
    status: ListenerSet<ConnectionStatus>,
    config: ListenerSet<SharedConfig>,

    // Replay caches
    last_state: Option<UpstreamState>,
    zones: HashMap<String, ZoneState>,
    queues: HashMap<String, QueueState>,
    last_config: Option<SharedConfig>,
}

/// Fan-out point between the event pump and application callbacks.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    inner: Mutex<Listeners>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Listeners> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register `listener`, replay `cached` to it, then flush whatever was
    /// dispatched in the meantime. No lock is held while it runs.
    fn attach<T: Clone>(
        &self,
        listener: Listener<T>,
        set: fn(&mut Listeners) -> &mut ListenerSet<T>,
        cached: impl FnOnce(&Listeners) -> Vec<T>,
    ) -> Subscription {
        let id = self.next();
        let replay = {
            let mut inner = self.lock();
            let replay = cached(&inner);
            set(&mut inner).entries.push(Entry {
                id,
                listener: Arc::clone(&listener),
                held: Some(Vec::new()),
            });
            replay
        };
        for value in &replay {
            listener(value);
        }
        loop {
            let held = set(&mut self.lock()).take_held(id);
            let Some(held) = held else { break };
            for value in &held {
                listener(value);
            }
        }
        Subscription(id)
    }

    // ── Registration ─────────────────────────────────────────────────

    pub fn on_state(&self, f: impl Fn(&UpstreamState) + Send + Sync + 'static) -> Subscription {
        let listener: Listener<UpstreamState> = Arc::new(f);
        self.attach(listener, |l| &mut l.state, |inner| {
            let latest = inner
                .last_state
                .clone()
                .unwrap_or_else(|| UpstreamState::phase(UpstreamPhase::Starting));
            if latest.is_terminal() {
                Vec::new()
            } else {
                vec![latest]
            }
        })
    }

    pub fn on_zone(&self, f: impl Fn(&ZoneState) + Send + Sync + 'static) -> Subscription {
        let listener: Listener<ZoneState> = Arc::new(f);
        self.attach(listener, |l| &mut l.zone, |inner| {
            inner.zones.values().cloned().collect()
        })
    }

    pub fn on_queue(&self, f: impl Fn(&QueueState) + Send + Sync + 'static) -> Subscription {
        let listener: Listener<QueueState> = Arc::new(f);
        self.attach(listener, |l| &mut l.queue, |inner| {
            inner.queues.values().cloned().collect()
        })
    }

    pub fn on_command_state(
        &self,
        f: impl Fn(&CommandNotification) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next();
        self.lock().command.push(id, Arc::new(f));
        Subscription(id)
    }

    pub fn on_status(&self, f: impl Fn(&ConnectionStatus) + Send + Sync + 'static) -> Subscription {
        let id = self.next();
        self.lock().status.push(id, Arc::new(f));
        Subscription(id)
    }

    pub fn on_config(&self, f: impl Fn(&SharedConfig) + Send + Sync + 'static) -> Subscription {
        let listener: Listener<SharedConfig> = Arc::new(f);
        self.attach(listener, |l| &mut l.config, |inner| {
            inner.last_config.clone().into_iter().collect()
        })
    }

    /// Revoke one listener. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let id = subscription.0;
        let mut inner = self.lock();
        inner.state.remove(id)
            || inner.zone.remove(id)
            || inner.queue.remove(id)
            || inner.command.remove(id)
            || inner.status.remove(id)
            || inner.config.remove(id)
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Update the replay caches and call every listener of the event's kind.
    pub fn dispatch(&self, event: &RelayEvent) {
        match event {
            RelayEvent::State(state) => {
                let listeners = {
                    let mut inner = self.lock();
                    if state.state == UpstreamPhase::Sync {
                        let known: Vec<&str> = state.zones.iter().map(|z| z.zone_id.as_str()).collect();
                        inner.zones.retain(|id, _| known.contains(&id.as_str()));
                        inner.queues.retain(|id, _| known.contains(&id.as_str()));
                    }
                    inner.last_state = Some(state.clone());
                    inner.state.deliver(state)
                };
                fan_out(&listeners, state);
            }
            RelayEvent::Zone(zone) => {
                let listeners = {
                    let mut inner = self.lock();
                    inner.zones.insert(zone.zone_id.clone(), zone.clone());
                    inner.zone.deliver(zone)
                };
                fan_out(&listeners, zone);
            }
            RelayEvent::Queue(queue) => {
                let listeners = {
                    let mut inner = self.lock();
                    inner.queues.insert(queue.zone_id.clone(), queue.clone());
                    inner.queue.deliver(queue)
                };
                fan_out(&listeners, queue);
            }
            RelayEvent::CommandState(notification) => {
                let listeners = self.lock().command.snapshot();
                fan_out(&listeners, notification);
            }
            RelayEvent::Config(config) => {
                let listeners = {
                    let mut inner = self.lock();
                    inner.last_config = Some(config.clone());
                    inner.config.deliver(config)
                };
                fan_out(&listeners, config);
            }
            // Heartbeats drive liveness, not listeners.
            RelayEvent::Ping(_) => {}
        }
    }

    pub fn publish_status(&self, status: &ConnectionStatus) {
        let listeners = self.lock().status.snapshot();
        fan_out(&listeners, status);
    }

    /// Forget everything cached. Used when the relay version changed and
    /// a full resynchronization follows.
    pub fn reset_caches(&self) {
        let mut inner = self.lock();
        inner.last_state = None;
        inner.zones.clear();
        inner.queues.clear();
        inner.last_config = None;
    }

    pub fn zone(&self, zone_id: &str) -> Option<ZoneState> {
        self.lock().zones.get(zone_id).cloned()
    }

    pub fn zones(&self) -> Vec<ZoneState> {
        self.lock().zones.values().cloned().collect()
    }

    pub fn state(&self) -> Option<UpstreamState> {
        self.lock().last_state.clone()
    }
}

fn fan_out<T>(listeners: &[Listener<T>], value: &T) {
    for listener in listeners {
        listener(value);
    }
}
