use tracing::info;

use crate::cli::{GlobalOpts, ServeArgs};
use crate::error::CliError;

pub async fn handle(args: ServeArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let mut config = super::load_config(global)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(upstream) = args.upstream {
        config.server.upstream_url = upstream;
    }
    if let Some(base_path) = args.base_path {
        config.server.base_path = base_path;
    }
    let relay_config = config.server.relay_config()?;

    let printer = super::printer(global);
    printer.print(&format!(
        "relay listening on http://{}{} (upstream {})",
        relay_config.listen, relay_config.base_path, relay_config.upstream_url
    ));

    sonora_server::serve(relay_config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
    })
    .await?;
    Ok(())
}
