pub mod config_cmd;
pub mod send;
pub mod serve;
pub mod watch;

use sonora_config::Config;
use sonora_core::{Connection, ConnectionConfig};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output::{Printer, should_color};

/// Load the layered config and apply global flag overrides.
pub fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    let mut config = sonora_config::load_config(global.config.as_deref())?;
    if let Some(relay) = &global.relay {
        config.client.relay_url.clone_from(relay);
    }
    Ok(config)
}

pub fn printer(global: &GlobalOpts) -> Printer {
    Printer {
        format: global.output,
        color: should_color(global.color),
        quiet: global.quiet,
    }
}

/// Build a client connection from config. Does not contact the relay.
pub fn connection(config: &ConnectionConfig) -> Result<Connection, CliError> {
    Ok(Connection::new(config.clone())?)
}
