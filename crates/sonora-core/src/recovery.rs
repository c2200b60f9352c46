// ── Recovery orchestration ──
//
// `StaleFlag` is the "must refresh" marker set by liveness timeouts,
// event-stream termination and 403 responses. `HealthCheck` is the
// caller-driven periodic task that turns the flag into a refresh, but only
// while the application says it is visible.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Shared "must refresh" flag.
#[derive(Debug, Clone, Default)]
pub struct StaleFlag(Arc<AtomicBool>);

impl StaleFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Periodic `refresh()` driver. Stops when dropped.
pub struct HealthCheck {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthCheck {
    /// Call `connection.refresh()` every `period` while `visible` is true.
    pub fn spawn(connection: Connection, period: Duration, visible: watch::Receiver<bool>) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if !*visible.borrow() {
                    continue;
                }
                match connection.refresh().await {
                    Ok(true) => debug!("health check refreshed the connection"),
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "health check refresh failed"),
                }
            }
        });
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
