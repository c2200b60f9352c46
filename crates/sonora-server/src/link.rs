//! Upstream link manager.
//!
//! Owns the single websocket to the audio device. When it drops, exactly
//! one reconnect is scheduled with exponential backoff and jitter; pairing
//! resets the attempt counter. Everything the device pushes is ingested
//! into the [`UpstreamHub`]; request/reply traffic (commands, browse,
//! load) is correlated here by `request_id`.
//!
//! ```text
//! Disconnected ─start─▶ Connecting ─paired─▶ Paired
//!                          ▲                   │
//!                          └──backoff── Lost | Error
//! ```

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use sonora_api::upstream::{self, DeviceMessage, DeviceRequest};
use sonora_api::{Command, CommandNotification, UpstreamPhase, UpstreamState};

use crate::error::RelayError;
use crate::hub::UpstreamHub;

const OUTBOUND_CHANNEL_SIZE: usize = 64;

// ── LinkState ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Paired,
    Lost,
    Error,
}

// ── BackoffPolicy ────────────────────────────────────────────────────

/// Exponential backoff with bounded jitter.
///
/// `delay(n) = min(min_delay · 2^(n-1), max_delay) + U(0, min(max_jitter, base/4))`,
/// capped again at `max_delay`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub min_delay: Duration,
    /// Upper bound on any delay, jitter included. Default: 60s.
    pub max_delay: Duration,
    /// Upper bound on the jitter term. Default: 1s.
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay without jitter for attempt `n` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.min_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    /// Delay for attempt `n` with `unit ∈ [0, 1]` selecting the jitter.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_cap = self.max_jitter.min(base / 4);
        let jitter = jitter_cap.mul_f64(unit.clamp(0.0, 1.0));
        (base + jitter).min(self.max_delay)
    }

    /// Delay for attempt `n` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_jitter(attempt, rand::thread_rng().r#gen::<f64>())
    }
}

// ── Pending replies ──────────────────────────────────────────────────

/// Where the device's `reply` for a given `request_id` goes.
enum PendingReply {
    /// Becomes a `command_state` event on the issuing session's channel.
    Command {
        command_id: String,
        sink: broadcast::Sender<CommandNotification>,
    },
    /// Completes an awaiting browse/load call.
    Request(oneshot::Sender<Result<Value, RelayError>>),
}

impl PendingReply {
    fn fail(self, error: &RelayError) {
        match self {
            Self::Command { command_id, sink } => {
                let _ = sink.send(CommandNotification::rejected(command_id, error.to_string()));
            }
            Self::Request(tx) => {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }
}

// ── UpstreamLink ─────────────────────────────────────────────────────

/// Handle to the upstream link manager. Cheaply cloneable.
#[derive(Clone)]
pub struct UpstreamLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    url: Url,
    policy: BackoffPolicy,
    hub: Arc<UpstreamHub>,
    state: watch::Sender<LinkState>,
    /// Reconnect attempts since the last successful pairing.
    attempt: AtomicU32,
    /// Bumped for every connection; late reports from older ones are ignored.
    generation: AtomicU64,
    /// The single scheduled reconnect, if any.
    reconnect: Mutex<Option<JoinHandle<()>>>,
    /// Present only while paired.
    outbound: Mutex<Option<mpsc::Sender<DeviceRequest>>>,
    pending: DashMap<String, PendingReply>,
    /// Replaced on every `start()`, cancelled on `stop()`.
    cancel: Mutex<CancellationToken>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpstreamLink {
    pub fn new(url: Url, policy: BackoffPolicy, hub: Arc<UpstreamHub>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let cancel = CancellationToken::new();
        cancel.cancel();
        Self {
            inner: Arc::new(LinkInner {
                url,
                policy,
                hub,
                state,
                attempt: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                reconnect: Mutex::new(None),
                outbound: Mutex::new(None),
                pending: DashMap::new(),
                cancel: Mutex::new(cancel),
            }),
        }
    }

    pub fn hub(&self) -> &Arc<UpstreamHub> {
        &self.inner.hub
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !lock(&self.inner.cancel).is_cancelled()
    }

    /// Start connecting. No-op if already running.
    pub fn start(&self) {
        {
            let mut cancel = lock(&self.inner.cancel);
            if !cancel.is_cancelled() {
                return;
            }
            *cancel = CancellationToken::new();
        }
        self.inner.attempt.store(0, Ordering::SeqCst);
        self.inner.hub.set_phase(UpstreamPhase::Starting);
        info!(url = %self.inner.url, "starting upstream link");
        let generation = self.inner.next_generation();
        self.inner.spawn_connection(generation);
    }

    /// Tear the link down and publish the terminal `STOPPED` state.
    pub fn stop(&self) {
        lock(&self.inner.cancel).cancel();
        if let Some(timer) = lock(&self.inner.reconnect).take() {
            timer.abort();
        }
        lock(&self.inner.outbound).take();
        self.inner.fail_pending(&RelayError::NotStarted);
        self.inner.state.send_replace(LinkState::Disconnected);
        self.inner.hub.zones.clear();
        self.inner.hub.queues.clear();
        self.inner.hub.set_phase(UpstreamPhase::Stopped);
        info!("upstream link stopped");
    }

    // ── Requests ─────────────────────────────────────────────────────

    /// Forward a command. Its outcome is delivered on `sink`, in the order
    /// the device replies; if the device is unreachable it is rejected
    /// immediately.
    pub fn submit_command(
        &self,
        session_id: &str,
        command_id: &str,
        command: Command,
        sink: broadcast::Sender<CommandNotification>,
    ) {
        let request_id = command_id.to_string();
        let request = DeviceRequest::Command {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            command,
        };
        let pending = PendingReply::Command {
            command_id: command_id.to_string(),
            sink,
        };
        if let Err(error) = self.inner.send_request(request_id, request, pending) {
            debug!(command_id, error = %error, "command rejected before reaching upstream");
        }
    }

    /// Pass a browse request through to the device.
    pub async fn browse(&self, session_id: &str, body: Value) -> Result<Value, RelayError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = DeviceRequest::Browse {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            body,
        };
        self.inner.round_trip(request_id, request).await
    }

    /// Pass a load request through to the device.
    pub async fn load(&self, session_id: &str, body: Value) -> Result<Value, RelayError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let request = DeviceRequest::Load {
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            body,
        };
        self.inner.round_trip(request_id, request).await
    }

    /// Ask the device to forget a session's navigation context.
    pub fn release_session(&self, session_id: &str) {
        let outbound = lock(&self.inner.outbound).clone();
        if let Some(tx) = outbound {
            let request = DeviceRequest::ReleaseSession {
                session_id: session_id.to_string(),
            };
            if tx.try_send(request).is_err() {
                debug!(session_id, "could not release upstream session context");
            }
        }
    }
}

impl LinkInner {
    fn cancel_token(&self) -> CancellationToken {
        lock(&self.cancel).clone()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn spawn_connection(self: &Arc<Self>, generation: u64) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.run_connection(generation).await });
    }

    /// One connection lifetime: connect, pump frames until it drops, report.
    async fn run_connection(self: Arc<Self>, generation: u64) {
        let cancel = self.cancel_token();
        self.state.send_replace(LinkState::Connecting);

        let connection = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = upstream::connect(&self.url) => result,
        };
        let (mut writer, mut reader) = match connection {
            Ok(connection) => connection.split(),
            Err(e) => {
                warn!(error = %e, "upstream connect failed");
                self.connection_ended(generation, LinkState::Error);
                return;
            }
        };

        let (tx, mut rx) = mpsc::channel::<DeviceRequest>(OUTBOUND_CHANNEL_SIZE);

        // Writer half. A send failure reports on its own so an error always
        // leads to a reconnect, even if the reader never sees the socket die.
        let writer_cancel = cancel.child_token();
        let writer_link = Arc::clone(&self);
        let writer_stop = writer_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = writer_stop.cancelled() => break,
                    request = rx.recv() => {
                        let Some(request) = request else { break };
                        if let Err(e) = writer.send(&request).await {
                            warn!(error = %e, "upstream write failed");
                            writer_link.connection_ended(generation, LinkState::Error);
                            return;
                        }
                    }
                }
            }
            writer.close().await;
        });

        let outcome = loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break None,
                message = reader.next() => match message {
                    Some(Ok(message)) => {
                        if let Some(end) = self.handle_message(message, &tx) {
                            break Some(end);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "upstream read failed");
                        break Some(LinkState::Error);
                    }
                    None => {
                        info!("upstream connection closed");
                        break Some(LinkState::Lost);
                    }
                },
            }
        };

        writer_cancel.cancel();
        if let Some(end) = outcome {
            self.connection_ended(generation, end);
        }
    }

    /// Apply one device message. Returns the end state if the message ends
    /// the pairing.
    fn handle_message(
        &self,
        message: DeviceMessage,
        tx: &mpsc::Sender<DeviceRequest>,
    ) -> Option<LinkState> {
        match message {
            DeviceMessage::Paired {
                core_id,
                display_name,
            } => {
                info!(core_id, display_name = display_name.as_deref().unwrap_or(""), "upstream paired");
                self.attempt.store(0, Ordering::SeqCst);
                if let Some(timer) = lock(&self.reconnect).take() {
                    timer.abort();
                }
                *lock(&self.outbound) = Some(tx.clone());
                self.state.send_replace(LinkState::Paired);
                self.hub.set_phase(UpstreamPhase::Syncing);
            }
            DeviceMessage::Unpaired => {
                info!("upstream unpaired");
                return Some(LinkState::Lost);
            }
            DeviceMessage::Zones { zones, outputs } => {
                debug!(zones = zones.len(), outputs = outputs.len(), "zone listing");
                let keep: Vec<&str> = zones.iter().map(|z| z.zone_id.as_str()).collect();
                self.hub.zones.retain_keys(&keep);
                self.hub.queues.retain_keys(&keep);
                self.hub.state.publish(UpstreamState {
                    state: UpstreamPhase::Sync,
                    zones,
                    outputs,
                });
            }
            DeviceMessage::ZoneChanged { zone } => {
                self.hub.zones.publish(zone.zone_id.clone(), zone);
            }
            DeviceMessage::ZoneRemoved { zone_id } => {
                self.hub.zones.remove(&zone_id);
                self.hub.queues.remove(&zone_id);
                // Clients prune their caches on a zone listing, so publish
                // the current one without the removed zone.
                let current = self.hub.state.current();
                if current.state == UpstreamPhase::Sync {
                    let mut listing = (*current).clone();
                    listing.zones.retain(|z| z.zone_id != zone_id);
                    listing.outputs.retain(|o| o.zone_id != zone_id);
                    self.hub.state.publish(listing);
                }
            }
            DeviceMessage::QueueChanged { queue } => {
                self.hub.queues.publish(queue.zone_id.clone(), queue);
            }
            DeviceMessage::Reply {
                request_id,
                ok,
                body,
                error,
            } => self.complete(&request_id, ok, body, error),
        }
        None
    }

    fn complete(&self, request_id: &str, ok: bool, body: Value, error: Option<String>) {
        let Some((_, pending)) = self.pending.remove(request_id) else {
            debug!(request_id, "reply for unknown request");
            return;
        };
        let cause = || error.clone().unwrap_or_else(|| "rejected by upstream".into());
        match pending {
            PendingReply::Command { command_id, sink } => {
                let notification = if ok {
                    CommandNotification::applied(command_id)
                } else {
                    CommandNotification::rejected(command_id, cause())
                };
                let _ = sink.send(notification);
            }
            PendingReply::Request(tx) => {
                let result = if ok {
                    Ok(body)
                } else {
                    Err(RelayError::Upstream(cause()))
                };
                let _ = tx.send(result);
            }
        }
    }

    fn send_request(
        &self,
        request_id: String,
        request: DeviceRequest,
        pending: PendingReply,
    ) -> Result<(), RelayError> {
        let outbound = lock(&self.outbound).clone();
        let Some(tx) = outbound else {
            let error = RelayError::UpstreamUnavailable;
            pending.fail(&error);
            return Err(error);
        };
        self.pending.insert(request_id.clone(), pending);
        if tx.try_send(request).is_err() {
            let error = RelayError::UpstreamUnavailable;
            if let Some((_, pending)) = self.pending.remove(&request_id) {
                pending.fail(&error);
            }
            return Err(error);
        }
        Ok(())
    }

    async fn round_trip(&self, request_id: String, request: DeviceRequest) -> Result<Value, RelayError> {
        let (tx, rx) = oneshot::channel();
        self.send_request(request_id, request, PendingReply::Request(tx))?;
        rx.await.unwrap_or(Err(RelayError::UpstreamLost))
    }

    fn fail_pending(&self, error: &RelayError) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                pending.fail(error);
            }
        }
    }

    /// Both halves of a connection may report its end; only the first
    /// report for the current generation changes state, and the reconnect
    /// guard absorbs the rest.
    fn connection_ended(self: &Arc<Self>, generation: u64, cause: LinkState) {
        if self.cancel_token().is_cancelled() {
            return;
        }
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "ignoring end of superseded upstream connection");
            return;
        }

        let previous = *self.state.borrow();
        if !matches!(previous, LinkState::Lost | LinkState::Error) {
            self.state.send_replace(cause);
            lock(&self.outbound).take();
            self.fail_pending(&RelayError::UpstreamLost);
            if previous == LinkState::Paired {
                self.hub.set_phase(UpstreamPhase::Lost);
            }
            warn!(state = %cause, "upstream link down");
        }
        self.schedule_reconnect();
    }

    /// Schedule one reconnect unless one is already pending.
    fn schedule_reconnect(self: &Arc<Self>) {
        let mut slot = lock(&self.reconnect);
        if slot.as_ref().is_some_and(|timer| !timer.is_finished()) {
            debug!("upstream reconnect already scheduled");
            return;
        }

        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        let delay = self.policy.delay(attempt);
        info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling upstream reconnect"
        );

        let inner = Arc::clone(self);
        let cancel = self.cancel_token();
        *slot = Some(tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let generation = inner.next_generation();
            lock(&inner.reconnect).take();
            inner.spawn_connection(generation);
        }));
    }
}

// ── Tests ────────────────────────────────────────────────────────────
