//! Session registry.
//!
//! The sole owner of the session map. A session is created on
//! registration and destroyed on explicit unregister or when its event
//! stream goes away, whichever comes first.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use sonora_api::{Command, CommandNotification};

use crate::error::RelayError;
use crate::hub::UpstreamHub;
use crate::link::UpstreamLink;

const COMMAND_CHANNEL_SIZE: usize = 64;

/// One browser (or CLI) connection as the relay sees it.
#[derive(Debug)]
pub struct Session {
    id: String,
    commands: broadcast::Sender<CommandNotification>,
    closed: CancellationToken,
    /// Bumped on every (re-)registration.
    epoch: AtomicU64,
}

impl Session {
    fn new(id: String) -> Self {
        let (commands, _) = broadcast::channel(COMMAND_CHANNEL_SIZE);
        Self {
            id,
            commands,
            closed: CancellationToken::new(),
            epoch: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Outcomes of commands this session issued. Nothing is replayed.
    pub fn subscribe_commands(&self) -> broadcast::Receiver<CommandNotification> {
        self.commands.subscribe()
    }

    /// Cancelled once the session is unregistered.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn reattach(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Creates, looks up, and destroys sessions keyed by client id.
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    link: UpstreamLink,
    started: AtomicBool,
}

impl SessionRegistry {
    pub fn new(link: UpstreamLink) -> Self {
        Self {
            sessions: DashMap::new(),
            link,
            started: AtomicBool::new(false),
        }
    }

    pub fn hub(&self) -> &Arc<UpstreamHub> {
        self.link.hub()
    }

    pub fn link(&self) -> &UpstreamLink {
        &self.link
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Open the registry and start the upstream link.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("session registry started");
        self.link.start();
    }

    /// Unregister every session and tear the upstream link down.
    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.unregister(&id);
        }
        self.link.stop();
        info!("session registry stopped");
    }

    /// Re-attach to a live session or create a fresh one.
    ///
    /// A `previous` id that names no live session is ignored and a new
    /// random id is allocated.
    pub fn register(&self, previous: Option<&str>) -> Result<Arc<Session>, RelayError> {
        if !self.is_started() {
            return Err(RelayError::NotStarted);
        }

        if let Some(previous) = previous {
            if let Some(session) = self.sessions.get(previous) {
                let epoch = session.reattach();
                debug!(client_id = previous, epoch, "session re-attached");
                return Ok(Arc::clone(&session));
            }
            debug!(client_id = previous, "previous session is gone, allocating a new one");
        }

        let session = Arc::new(Session::new(Uuid::new_v4().to_string()));
        self.sessions
            .insert(session.id.clone(), Arc::clone(&session));
        info!(client_id = %session.id, sessions = self.sessions.len(), "session registered");
        Ok(session)
    }

    /// Look up a live session. Unknown ids are an error, never a default.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, RelayError> {
        self.sessions
            .get(id)
            .map(|s| Arc::clone(&s))
            .ok_or_else(|| RelayError::UnknownClient(id.to_string()))
    }

    /// Destroy a session. No-op for unknown ids.
    pub fn unregister(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            self.release(&session);
        }
    }

    /// Stream teardown: unregister only if nobody re-registered the id
    /// after the stream attached at `epoch`.
    pub fn detach(&self, id: &str, epoch: u64) {
        match self.sessions.remove_if(id, |_, s| s.epoch() == epoch) {
            Some((_, session)) => self.release(&session),
            None => debug!(client_id = id, epoch, "stream closed for re-attached or removed session"),
        }
    }

    fn release(&self, session: &Session) {
        session.closed.cancel();
        self.link.release_session(&session.id);
        info!(client_id = %session.id, sessions = self.sessions.len(), "session unregistered");
    }

    // ── Upstream pass-through ────────────────────────────────────────

    /// Hand a command to the upstream link. The returned id correlates
    /// with the `command_state` event that reports its outcome.
    pub fn submit_command(&self, id: &str, command: Command) -> Result<String, RelayError> {
        let session = self.get(id)?;
        let command_id = Uuid::new_v4().to_string();
        debug!(client_id = id, command_id, kind = %command.kind, "submitting command");
        self.link
            .submit_command(id, &command_id, command, session.commands.clone());
        Ok(command_id)
    }

    pub async fn browse(&self, id: &str, body: Value) -> Result<Value, RelayError> {
        self.get(id)?;
        self.link.browse(id, body).await
    }

    pub async fn load(&self, id: &str, body: Value) -> Result<Value, RelayError> {
        self.get(id)?;
        self.link.load(id, body).await
    }
}
