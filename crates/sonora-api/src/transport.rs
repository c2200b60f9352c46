// Shared transport configuration for building reqwest::Client instances.
//
// The relay event stream is long-lived, so the whole-request timeout is
// never applied to it: only the connect timeout is set on the client, and
// short calls get their deadline per request.

use std::time::Duration;

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Deadline for establishing a TCP/TLS connection.
    pub connect_timeout: Duration,
    /// Deadline for a complete request/response exchange (not the event stream).
    pub request_timeout: Duration,
    /// Accept self-signed certificates on the relay.
    pub accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, crate::error::Error> {
        let builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(concat!("sonora/", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(self.accept_invalid_certs);

        Ok(builder.build()?)
    }
}
