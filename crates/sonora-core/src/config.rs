use std::time::Duration;

use url::Url;

use sonora_api::TransportConfig;

/// Everything a [`Connection`](crate::Connection) needs to reach a relay.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Relay base URL including the base path, e.g. `http://host:8090/api`.
    pub relay_url: Url,
    /// Identity to re-attach to on the first `start()`.
    pub client_id: Option<String>,
    pub transport: TransportConfig,
    /// Spacing between attempts of an explicit `restart()`. Default: 1s.
    pub restart_spacing: Duration,
    /// Period of the visibility-gated health check. Default: 5s.
    pub health_check_period: Duration,
    /// Resends allowed after a 403 and a successful refresh. Default: 1.
    pub max_auth_retries: u32,
    /// How long `execute()` waits for a command's outcome. Default: 30s.
    pub command_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(relay_url: Url) -> Self {
        Self {
            relay_url,
            client_id: None,
            transport: TransportConfig::default(),
            restart_spacing: Duration::from_secs(1),
            health_check_period: Duration::from_secs(5),
            max_auth_retries: 1,
            command_timeout: Duration::from_secs(30),
        }
    }
}
