use tokio::sync::watch;
use tracing::info;

use sonora_api::RelayEvent;

use crate::cli::{GlobalOpts, WatchArgs};
use crate::error::CliError;

pub async fn handle(args: WatchArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut config = super::load_config(global)?;
    if args.client_id.is_some() {
        config.client.client_id = args.client_id;
    }
    let connection = super::connection(&config.client.connection_config()?)?;
    let printer = super::printer(global);

    connection.on_status(move |s| printer.status(s));
    connection.on_state(move |s| printer.event(&RelayEvent::State(s.clone())));
    connection.on_config(move |c| printer.event(&RelayEvent::Config(c.clone())));
    connection.on_zone(move |z| printer.event(&RelayEvent::Zone(z.clone())));
    connection.on_queue(move |q| printer.event(&RelayEvent::Queue(q.clone())));
    connection.on_command_state(move |n| printer.event(&RelayEvent::CommandState(n.clone())));

    connection.start().await?;

    // A terminal is always "visible"; keep the sender alive for the watch.
    let (_visible, visible_rx) = watch::channel(true);
    let health = connection.health_check(visible_rx);

    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, closing session");
    health.stop();
    connection.stop().await;
    Ok(())
}
