//! Client side of the sonora relay protocol.
//!
//! - **[`Connection`]**: the lifecycle. [`start()`](Connection::start)
//!   validates the relay version, registers (re-attaching to a previous
//!   client id when possible), opens the event stream and publishes
//!   [`ConnectionStatus::Started`]. [`restart()`](Connection::restart)
//!   retries until it succeeds or is superseded;
//!   [`refresh()`](Connection::refresh) restarts only when the connection
//!   was marked stale.
//!
//! - **[`ListenerRegistry`]**: typed listeners with replay-on-attach and
//!   opaque [`Subscription`] handles.
//!
//! - **[`LivenessMonitor`]**: heartbeat deadline of 1.5 × the advertised
//!   interval. Expiry only marks the connection stale.
//!
//! - **[`HealthCheck`]**: periodic, visibility-gated `refresh()`.
//!
//! Mutating calls (`command`, `browse`, `load`) recover transparently from
//! an expired session: mark stale, refresh, resend the identical request,
//! a bounded number of times.

pub mod config;
pub mod connection;
pub mod error;
pub mod listeners;
pub mod liveness;
pub mod recovery;

pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionStatus};
pub use error::CoreError;
pub use listeners::{ListenerRegistry, Subscription};
pub use liveness::LivenessMonitor;
pub use recovery::{HealthCheck, StaleFlag};
