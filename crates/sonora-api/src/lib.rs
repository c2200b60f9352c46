//! Wire-level building blocks shared by the sonora relay and its clients.
//!
//! - [`protocol`]: every payload that crosses the relay's HTTP/SSE surface,
//!   plus the constants both sides must agree on (version header, heartbeat
//!   period, liveness multiplier).
//! - [`RelayClient`]: raw HTTP client for the relay endpoints. One method
//!   per route, no retries, no state. Recovery lives in `sonora-core`.
//! - [`upstream`]: JSON-over-websocket transport to the controlled audio
//!   device. The reconnect policy lives in `sonora-server`.

pub mod error;
pub mod protocol;
pub mod relay;
pub mod transport;
pub mod upstream;

pub use error::Error;
pub use protocol::{
    Command, CommandAccepted, CommandNotification, CommandState, Heartbeat, OutputDescription,
    PlaybackState, QueueState, RelayEvent, SharedConfig, UpstreamPhase, UpstreamState,
    ZoneDescription, ZoneState,
};
pub use relay::{EventStream, Registration, RelayClient};
pub use transport::TransportConfig;
