use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tracing::info;
use url::Url;

use sonora_api::SharedConfig;
use sonora_api::protocol::HEARTBEAT_INTERVAL_SECS;

use crate::hub::UpstreamHub;
use crate::link::{BackoffPolicy, UpstreamLink};
use crate::routes::{AppState, build_router, normalize_base_path};
use crate::session::SessionRegistry;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub base_path: String,
    /// Websocket URL of the upstream audio device.
    pub upstream_url: Url,
    pub heartbeat: Duration,
    pub backoff: BackoffPolicy,
    /// Pushed to every session as the `config` event.
    pub shared: SharedConfig,
}

impl RelayConfig {
    /// Defaults for everything but the upstream device address.
    pub fn new(upstream_url: Url) -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8090)),
            base_path: "/api".into(),
            upstream_url,
            heartbeat: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            backoff: BackoffPolicy::default(),
            shared: SharedConfig::default(),
        }
    }
}

/// A wired-up relay: hub, upstream link, registry, and router state.
pub struct Relay {
    state: AppState,
}

impl Relay {
    pub fn new(config: &RelayConfig) -> Self {
        let hub = Arc::new(UpstreamHub::new(config.shared.clone()));
        let link = UpstreamLink::new(config.upstream_url.clone(), config.backoff.clone(), hub);
        let registry = Arc::new(SessionRegistry::new(link));
        Self {
            state: AppState {
                registry,
                base_path: normalize_base_path(&config.base_path).into(),
                heartbeat: config.heartbeat,
            },
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.state.registry
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub fn start(&self) {
        self.state.registry.start();
    }

    pub fn stop(&self) {
        self.state.registry.stop();
    }
}

/// Run the relay until `shutdown` resolves.
pub async fn serve(
    config: RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    serve_on(listener, &config, shutdown).await
}

/// Run the relay on an already-bound listener until `shutdown` resolves.
///
/// Stopping the registry ends every open event stream, which lets the
/// graceful shutdown complete.
pub async fn serve_on(
    listener: TcpListener,
    config: &RelayConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let relay = Relay::new(config);
    relay.start();

    let local_addr = listener.local_addr()?;
    info!(
        addr = %local_addr,
        base_path = %config.base_path,
        upstream = %config.upstream_url,
        "sonora relay listening"
    );

    let registry = Arc::clone(relay.registry());
    let shutdown = async move {
        shutdown.await;
        info!("shutting down relay");
        registry.stop();
    };

    axum::serve(listener, relay.router())
        .with_graceful_shutdown(shutdown)
        .await?;

    relay.stop();
    info!("relay stopped");
    Ok(())
}
