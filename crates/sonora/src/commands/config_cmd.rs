//! Config subcommand handlers.

use sonora_config::{Config, config_path, save_config};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(args: ConfigArgs, global: &GlobalOpts) -> Result<(), CliError> {
    let printer = super::printer(global);
    let path = global.config.clone().unwrap_or_else(config_path);

    match args.command {
        ConfigCommand::Path => {
            printer.print(&path.display().to_string());
            Ok(())
        }
        ConfigCommand::Show => {
            let config = super::load_config(global)?;
            printer.print(config.to_toml()?.trim_end());
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            save_config(&Config::default(), &path)?;
            printer.print(&format!("wrote {}", path.display()));
            Ok(())
        }
    }
}
