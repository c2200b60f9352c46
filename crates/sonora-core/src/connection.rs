// ── Client connection lifecycle ──
//
// version → (OUTDATED?) → register → events → STARTED{client_id}
//
// Every start/restart runs under its own cancellation token; a newer
// restart cancels the older one, which then fails with
// `CoreError::Cancelled` instead of a transport error. Mutating calls that
// hit a 403 mark the connection stale, refresh it, and resend the same
// request a bounded number of times.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sonora_api::{
    Command, CommandNotification, CommandState, EventStream, QueueState, RelayClient, RelayEvent,
    SharedConfig, UpstreamState, ZoneState,
};

use crate::config::ConnectionConfig;
use crate::error::CoreError;
use crate::listeners::{ListenerRegistry, Subscription};
use crate::liveness::LivenessMonitor;
use crate::recovery::{HealthCheck, StaleFlag};

// ── ConnectionStatus ─────────────────────────────────────────────────

/// Lifecycle status observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotStarted,
    /// The relay version changed; cached state was discarded and a full
    /// resynchronization follows.
    Outdated,
    /// Live. Persist `client_id` to re-attach with the same identity later.
    Started { client_id: String },
}

// ── Connection ───────────────────────────────────────────────────────

/// Resilient connection to one relay. Cheaply cloneable.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ActiveSession {
    client_id: String,
    /// Stops this session's event pump.
    cancel: CancellationToken,
}

struct ConnectionInner {
    config: ConnectionConfig,
    client: RelayClient,
    listeners: Arc<ListenerRegistry>,
    stale: StaleFlag,
    status: watch::Sender<ConnectionStatus>,
    session: Mutex<Option<ActiveSession>>,
    /// Token of the newest start/restart.
    attempt: Mutex<CancellationToken>,
    known_version: Mutex<Option<String>>,
    /// Identity requested on the next registration.
    client_id: Mutex<Option<String>>,
    /// Held for the duration of a refresh.
    recovery: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Await `fut` unless `token` is cancelled first.
async fn cancellable<T>(
    token: &CancellationToken,
    fut: impl Future<Output = Result<T, sonora_api::Error>>,
) -> Result<T, CoreError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(CoreError::Cancelled),
        result = fut => result.map_err(CoreError::from),
    }
}

impl Connection {
    /// Create a connection. Does NOT contact the relay; call
    /// [`start()`](Self::start).
    pub fn new(config: ConnectionConfig) -> Result<Self, CoreError> {
        let client = RelayClient::new(config.relay_url.clone(), &config.transport)?;
        Ok(Self::with_client(config, client))
    }

    /// Create a connection around a pre-built relay client.
    pub fn with_client(config: ConnectionConfig, client: RelayClient) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::NotStarted);
        let client_id = config.client_id.clone();
        Self {
            inner: Arc::new(ConnectionInner {
                config,
                client,
                listeners: Arc::new(ListenerRegistry::new()),
                stale: StaleFlag::new(),
                status,
                session: Mutex::new(None),
                attempt: Mutex::new(CancellationToken::new()),
                known_version: Mutex::new(None),
                client_id: Mutex::new(client_id),
                recovery: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Client id of the live session, if started.
    pub fn client_id(&self) -> Option<String> {
        lock(&self.inner.session)
            .as_ref()
            .map(|s| s.client_id.clone())
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    /// Whether the next `refresh()` will restart.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.is_set()
    }

    pub fn mark_stale(&self) {
        self.inner.stale.mark();
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// One connection attempt. Cancels any attempt still in flight.
    pub async fn start(&self) -> Result<String, CoreError> {
        let token = self.begin_attempt();
        self.attempt_start(&token, false).await
    }

    /// Close the current event channel and start again, retrying with a
    /// fixed spacing until it succeeds or a newer restart supersedes it.
    pub async fn restart(&self) -> Result<String, CoreError> {
        let token = self.begin_attempt();
        let spacing = self.inner.config.restart_spacing;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.attempt_start(&token, attempt > 1).await {
                Ok(client_id) => return Ok(client_id),
                Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
                Err(e) => {
                    warn!(attempt, error = %e, "restart failed, retrying");
                    tokio::select! {
                        biased;
                        () = token.cancelled() => return Err(CoreError::Cancelled),
                        () = tokio::time::sleep(spacing) => {}
                    }
                }
            }
        }
    }

    /// Restart once if the connection is marked stale; no-op otherwise.
    /// Returns whether a restart happened. On failure the mark is restored
    /// so the next health check tries again.
    pub async fn refresh(&self) -> Result<bool, CoreError> {
        let _recovery = self.inner.recovery.lock().await;
        if !self.inner.stale.take() {
            return Ok(false);
        }
        info!("refreshing stale connection");
        match self.start().await {
            Ok(_) => Ok(true),
            Err(e) => {
                self.inner.stale.mark();
                Err(e)
            }
        }
    }

    /// Tear everything down and publish `NotStarted`.
    pub async fn stop(&self) {
        lock(&self.inner.attempt).cancel();
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = self.inner.client.unregister(&session.client_id).await {
                debug!(client_id = %session.client_id, error = %e, "unregister failed (non-fatal)");
            }
        }
        self.inner.stale.clear();
        self.publish_status(ConnectionStatus::NotStarted);
        info!("connection stopped");
    }

    /// Spawn the visibility-gated periodic refresh.
    pub fn health_check(&self, visible: watch::Receiver<bool>) -> HealthCheck {
        HealthCheck::spawn(self.clone(), self.inner.config.health_check_period, visible)
    }

    fn begin_attempt(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.inner.attempt), token.clone());
        previous.cancel();
        token
    }

    /// `retrying` attempts announce `NotStarted` only if the status moved
    /// away from it since the previous failure.
    async fn attempt_start(
        &self,
        token: &CancellationToken,
        retrying: bool,
    ) -> Result<String, CoreError> {
        let result = self.handshake(token).await;
        if let Err(e) = &result {
            if e.is_cancelled() {
                debug!("connection attempt superseded");
            } else {
                warn!(error = %e, "connection attempt failed");
                if let Some(session) = lock(&self.inner.session).take() {
                    session.cancel.cancel();
                }
                if !retrying || *self.inner.status.borrow() != ConnectionStatus::NotStarted {
                    self.publish_status(ConnectionStatus::NotStarted);
                }
            }
        }
        result
    }

    async fn handshake(&self, token: &CancellationToken) -> Result<String, CoreError> {
        let client = &self.inner.client;

        let version = cancellable(token, client.version()).await?;
        self.check_version(&version);

        let requested = lock(&self.inner.client_id).clone();
        let registration = cancellable(token, client.register(requested.as_deref())).await?;
        debug!(client_id = %registration.client_id, "registered");
        // A fresh id that loses to a newer attempt would be orphaned: the
        // newer attempt never learns it.
        let fresh = requested.as_deref() != Some(registration.client_id.as_str());

        // The relay now attributes the session to this registration, so the
        // old event channel can go without taking the session with it.
        if let Some(session) = lock(&self.inner.session).as_ref() {
            session.cancel.cancel();
        }

        let events = match cancellable(token, client.events(&registration.location)).await {
            Ok(events) => events,
            Err(e) => {
                if fresh || !e.is_cancelled() {
                    self.abandon(&registration.client_id).await;
                }
                return Err(e);
            }
        };

        let pump_cancel = CancellationToken::new();
        let installed = {
            let mut session = lock(&self.inner.session);
            if token.is_cancelled() {
                false
            } else {
                if let Some(old) = session.replace(ActiveSession {
                    client_id: registration.client_id.clone(),
                    cancel: pump_cancel.clone(),
                }) {
                    old.cancel.cancel();
                }
                true
            }
        };
        if !installed {
            drop(events);
            if fresh {
                self.abandon(&registration.client_id).await;
            }
            return Err(CoreError::Cancelled);
        }
        tokio::spawn(pump_events(
            events,
            Arc::clone(&self.inner.listeners),
            self.inner.stale.clone(),
            pump_cancel,
        ));

        let client_id = registration.client_id;
        *lock(&self.inner.client_id) = Some(client_id.clone());
        self.inner.stale.clear();
        info!(client_id = %client_id, "connection started");
        self.publish_status(ConnectionStatus::Started {
            client_id: client_id.clone(),
        });
        Ok(client_id)
    }

    fn check_version(&self, version: &str) {
        let previous = lock(&self.inner.known_version).replace(version.to_string());
        if let Some(previous) = previous {
            if previous != version {
                info!(previous = %previous, current = %version, "relay version changed");
                self.inner.listeners.reset_caches();
                self.publish_status(ConnectionStatus::Outdated);
            }
        }
    }

    /// Best-effort unregister so a failed start leaves no session behind.
    async fn abandon(&self, client_id: &str) {
        if let Err(e) = self.inner.client.unregister(client_id).await {
            debug!(client_id, error = %e, "could not unregister abandoned session");
        }
    }

    fn publish_status(&self, status: ConnectionStatus) {
        self.inner.status.send_replace(status.clone());
        self.inner.listeners.publish_status(&status);
    }

    // ── Mutating calls ───────────────────────────────────────────────

    /// Run `call` against the live session. On 403: mark stale, refresh,
    /// and resend the identical request, at most `max_auth_retries` times.
    async fn with_recovery<T, F, Fut>(&self, call: F) -> Result<T, CoreError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, sonora_api::Error>>,
    {
        let max_retries = self.inner.config.max_auth_retries;
        let mut retries: u32 = 0;
        loop {
            let client_id = self.client_id().ok_or(CoreError::NotStarted)?;
            match call(client_id).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_auth_expired() => {
                    if retries >= max_retries {
                        return Err(CoreError::AuthorizationExpired {
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    debug!(retries, "session expired, refreshing before resend");
                    self.inner.stale.mark();
                    self.refresh().await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Submit a command. Returns the relay-assigned command id; the
    /// outcome arrives later as a `command_state` event.
    pub async fn command(&self, command: &Command) -> Result<String, CoreError> {
        let client = &self.inner.client;
        self.with_recovery(|id| async move {
            client.command(&id, command).await.map(|a| a.command_id)
        })
        .await
    }

    pub async fn browse(&self, body: &Value) -> Result<Value, CoreError> {
        let client = &self.inner.client;
        self.with_recovery(|id| async move { client.browse(&id, body).await })
            .await
    }

    pub async fn load(&self, body: &Value) -> Result<Value, CoreError> {
        let client = &self.inner.client;
        self.with_recovery(|id| async move { client.load(&id, body).await })
            .await
    }

    /// Submit a command and wait for its outcome.
    pub async fn execute(&self, command: &Command) -> Result<CommandNotification, CoreError> {
        // Listen before submitting so the outcome cannot slip past.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = self.on_command_state(move |n| {
            let _ = tx.send(n.clone());
        });
        let outcome = self.await_outcome(command, &mut rx).await;
        self.unsubscribe(subscription);
        outcome
    }

    async fn await_outcome(
        &self,
        command: &Command,
        rx: &mut mpsc::UnboundedReceiver<CommandNotification>,
    ) -> Result<CommandNotification, CoreError> {
        let command_id = self.command(command).await?;
        let wait = async {
            while let Some(notification) = rx.recv().await {
                if notification.command_id == command_id {
                    return Some(notification);
                }
            }
            None
        };
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, wait).await {
            Ok(Some(notification)) => match notification.state {
                CommandState::Applied => Ok(notification),
                CommandState::Rejected => Err(CoreError::CommandRejected {
                    command_id,
                    cause: notification.cause.unwrap_or_default(),
                }),
            },
            Ok(None) => Err(CoreError::NotStarted),
            Err(_) => Err(CoreError::Timeout {
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    // ── Listeners ────────────────────────────────────────────────────

    pub fn on_state(&self, f: impl Fn(&UpstreamState) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_state(f)
    }

    pub fn on_zone(&self, f: impl Fn(&ZoneState) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_zone(f)
    }

    pub fn on_queue(&self, f: impl Fn(&QueueState) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_queue(f)
    }

    pub fn on_command_state(
        &self,
        f: impl Fn(&CommandNotification) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.listeners.on_command_state(f)
    }

    pub fn on_status(&self, f: impl Fn(&ConnectionStatus) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_status(f)
    }

    pub fn on_config(&self, f: impl Fn(&SharedConfig) + Send + Sync + 'static) -> Subscription {
        self.inner.listeners.on_config(f)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.listeners.unsubscribe(subscription)
    }
}

// ── Event pump ───────────────────────────────────────────────────────

/// Feed one session's event stream into the listeners until it ends or is
/// cancelled. A missed heartbeat or the end of the stream only marks the
/// connection stale.
async fn pump_events(
    mut events: EventStream,
    listeners: Arc<ListenerRegistry>,
    stale: StaleFlag,
    cancel: CancellationToken,
) {
    let mut liveness = LivenessMonitor::new();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = liveness.expired() => {
                warn!(
                    timeout_ms = liveness.timeout().map_or(0, |t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
                    "no heartbeat within liveness timeout"
                );
                stale.mark();
            }
            item = events.next() => match item {
                Some(Ok(event)) => {
                    if let RelayEvent::Ping(heartbeat) = &event {
                        liveness.heartbeat(*heartbeat);
                    }
                    listeners.dispatch(&event);
                }
                Some(Err(e)) => {
                    warn!(error = %e, "event stream failed");
                    stale.mark();
                    return;
                }
                None => {
                    info!("event stream ended");
                    stale.mark();
                    return;
                }
            },
        }
    }
}
