//! Clap derive structures for the `sonora` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// sonora -- share one home-audio controller between many sessions
#[derive(Debug, Parser)]
#[command(
    name = "sonora",
    version,
    about = "Relay and client for a shared home-audio controller",
    long_about = "Runs the session relay in front of an audio controller, or connects to\n\
        a running relay to watch its live events and submit commands.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SONORA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Relay URL including base path (overrides [client] relay_url)
    #[arg(long, short = 'r', global = true)]
    pub relay: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "text", global = true)]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One human-readable line per item
    Text,
    /// One compact JSON object per line
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the relay until interrupted
    Serve(ServeArgs),

    /// Connect to a relay and print its live events
    #[command(alias = "w")]
    Watch(WatchArgs),

    /// Submit one command and report its outcome
    Send(SendArgs),

    /// Inspect the configuration
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on (overrides [server] listen)
    #[arg(long, short = 'l')]
    pub listen: Option<String>,

    /// Websocket URL of the audio device (overrides [server] upstream_url)
    #[arg(long, short = 'u')]
    pub upstream: Option<String>,

    /// Route prefix (overrides [server] base_path)
    #[arg(long)]
    pub base_path: Option<String>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Re-attach to this client id instead of registering a new one
    #[arg(long)]
    pub client_id: Option<String>,
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Command type, e.g. PLAY_PAUSE
    pub kind: String,

    /// Command payload as JSON
    #[arg(long, short = 'd')]
    pub data: Option<String>,

    /// Print the command id and return without waiting for the outcome
    #[arg(long)]
    pub no_wait: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the resolved configuration
    Show,

    /// Print the config file path
    Path,

    /// Write a config file with every default spelled out
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
