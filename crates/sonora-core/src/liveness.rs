// ── Heartbeat-driven liveness ──
//
// The relay pings every session on a fixed period. Each ping re-arms a
// deadline of 1.5 × the advertised interval; if the deadline passes the
// connection is only *marked* stale. Recovery happens on the next
// `refresh()`.

use std::future::pending;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{Instant, Sleep, sleep_until};

use sonora_api::Heartbeat;
use sonora_api::protocol::liveness_timeout;

/// Deadline re-armed by every heartbeat. Disarmed until the first one.
#[derive(Debug, Default)]
pub struct LivenessMonitor {
    deadline: Option<Pin<Box<Sleep>>>,
    timeout: Option<Duration>,
}

impl LivenessMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-arm the deadline from an advertised interval.
    pub fn heartbeat(&mut self, heartbeat: Heartbeat) {
        let timeout = liveness_timeout(heartbeat.interval_seconds);
        let at = Instant::now() + timeout;
        match self.deadline.as_mut() {
            Some(deadline) => deadline.as_mut().reset(at),
            None => self.deadline = Some(Box::pin(sleep_until(at))),
        }
        self.timeout = Some(timeout);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Timeout derived from the last heartbeat, if any arrived.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolves once the deadline passes, then disarms. Pending forever
    /// while disarmed. Cancel-safe.
    pub async fn expired(&mut self) {
        match self.deadline.as_mut() {
            Some(deadline) => {
                deadline.as_mut().await;
                self.deadline = None;
            }
            None => pending::<()>().await,
        }
    }
}
