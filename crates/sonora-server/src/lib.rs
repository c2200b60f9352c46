//! Session relay between many browser clients and one upstream audio device.
//!
//! The [`UpstreamLink`] keeps a websocket to the device alive and feeds the
//! process-wide [`UpstreamHub`]. Clients register with the
//! [`SessionRegistry`] and receive a per-session event stream built by
//! [`multiplexer::session_events`], exposed over HTTP by [`routes`].

pub mod error;
pub mod hub;
pub mod link;
pub mod multiplexer;
pub mod routes;
pub mod server;
pub mod session;

pub use error::RelayError;
pub use hub::{KeyedUpdate, Latest, LatestByKey, UpstreamHub};
pub use link::{BackoffPolicy, LinkState, UpstreamLink};
pub use routes::{AppState, RELAY_VERSION, build_router};
pub use server::{Relay, RelayConfig, serve, serve_on};
pub use session::{Session, SessionRegistry};
