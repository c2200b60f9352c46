// ── Replay-on-subscribe broadcasts ──
//
// Process-wide shared state fed by the upstream link and read by every
// session multiplexer. Each primitive hands a new subscriber the current
// value(s) first, then every later change.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, watch};

use sonora_api::{QueueState, SharedConfig, UpstreamPhase, UpstreamState, ZoneState};

const KEYED_CHANNEL_CAPACITY: usize = 256;

/// A single latest value. Subscribers see the current value immediately
/// and are woken on every later change. Intermediate values a slow
/// subscriber misses are coalesced into the latest one.
pub struct Latest<T> {
    tx: watch::Sender<Arc<T>>,
}

impl<T: Send + Sync + 'static> Latest<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn publish(&self, value: T) {
        // `send_replace` updates unconditionally, even with zero receivers.
        self.tx.send_replace(Arc::new(value));
    }

    pub fn current(&self) -> Arc<T> {
        Arc::clone(&*self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<T>> {
        self.tx.subscribe()
    }
}

/// A change to one key of a [`LatestByKey`].
#[derive(Debug, PartialEq)]
pub enum KeyedUpdate<T> {
    Upserted(Arc<T>),
    Removed(String),
}

// Written by hand: a derive would require `T: Clone`, but only the `Arc`
// is cloned.
impl<T> Clone for KeyedUpdate<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Upserted(value) => Self::Upserted(Arc::clone(value)),
            Self::Removed(key) => Self::Removed(key.clone()),
        }
    }
}

/// Latest value per key, each key replaced independently.
///
/// Publishing and subscribing take the same lock, so a subscriber's
/// snapshot and its live feed never overlap or leave a gap.
pub struct LatestByKey<T> {
    inner: Mutex<KeyedInner<T>>,
}

struct KeyedInner<T> {
    values: HashMap<String, Arc<T>>,
    tx: broadcast::Sender<KeyedUpdate<T>>,
}

impl<T: Send + Sync + 'static> LatestByKey<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(KEYED_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(KeyedInner {
                values: HashMap::new(),
                tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KeyedInner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, key: impl Into<String>, value: T) {
        let value = Arc::new(value);
        let mut inner = self.lock();
        inner.values.insert(key.into(), Arc::clone(&value));
        // No receivers is fine: late subscribers get the snapshot.
        let _ = inner.tx.send(KeyedUpdate::Upserted(value));
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.lock();
        if inner.values.remove(key).is_some() {
            let _ = inner.tx.send(KeyedUpdate::Removed(key.to_string()));
        }
    }

    /// Drop every key not in `keep`.
    pub fn retain_keys(&self, keep: &[&str]) {
        let mut inner = self.lock();
        let stale: Vec<String> = inner
            .values
            .keys()
            .filter(|k| !keep.contains(&k.as_str()))
            .cloned()
            .collect();
        for key in stale {
            inner.values.remove(&key);
            let _ = inner.tx.send(KeyedUpdate::Removed(key));
        }
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        let keys: Vec<String> = inner.values.drain().map(|(k, _)| k).collect();
        for key in keys {
            let _ = inner.tx.send(KeyedUpdate::Removed(key));
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.lock().values.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().values.is_empty()
    }

    /// Current value of every known key, plus a feed of later changes.
    pub fn subscribe(&self) -> (Vec<Arc<T>>, broadcast::Receiver<KeyedUpdate<T>>) {
        let inner = self.lock();
        let snapshot = inner.values.values().cloned().collect();
        (snapshot, inner.tx.subscribe())
    }
}

impl<T: Send + Sync + 'static> Default for LatestByKey<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ── UpstreamHub ──────────────────────────────────────────────────────

/// Every broadcast a session multiplexer reads from. Mutated only by the
/// upstream link (state, zones, queues) and by the relay at boot (config).
pub struct UpstreamHub {
    pub state: Latest<UpstreamState>,
    pub zones: LatestByKey<ZoneState>,
    pub queues: LatestByKey<QueueState>,
    pub config: Latest<SharedConfig>,
}

impl UpstreamHub {
    pub fn new(config: SharedConfig) -> Self {
        Self {
            state: Latest::new(UpstreamState::phase(UpstreamPhase::Starting)),
            zones: LatestByKey::new(),
            queues: LatestByKey::new(),
            config: Latest::new(config),
        }
    }

    /// Publish a bare phase change (no zone listing).
    pub fn set_phase(&self, phase: UpstreamPhase) {
        self.state.publish(UpstreamState::phase(phase));
    }
}

impl Default for UpstreamHub {
    fn default() -> Self {
        Self::new(SharedConfig::default())
    }
}
