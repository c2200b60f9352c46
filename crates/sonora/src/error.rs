//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use sonora_config::ConfigError;
use sonora_core::CoreError;

pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const REJECTED: i32 = 6;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to relay at {url}")]
    #[diagnostic(
        code(sonora::connection_failed),
        help(
            "Check that the relay is running and reachable.\n\
             Reason: {reason}\n\
             Try: sonora serve, or pass --relay http://host:8090/api"
        )
    )]
    ConnectionFailed { url: String, reason: String },

    #[error("The relay no longer recognises this session")]
    #[diagnostic(
        code(sonora::session_expired),
        help("The relay may have restarted. Run the command again to register a new session.")
    )]
    SessionExpired,

    #[error("Relay error: {message}")]
    #[diagnostic(code(sonora::relay))]
    Relay { message: String },

    // ── Commands ─────────────────────────────────────────────────────
    #[error("Command {command_id} was rejected: {cause}")]
    #[diagnostic(
        code(sonora::rejected),
        help("The audio device refused the command or is not connected to the relay.")
    )]
    Rejected { command_id: String, cause: String },

    #[error("Timed out after {seconds}s")]
    #[diagnostic(
        code(sonora::timeout),
        help("Increase [client] timeout_secs or command_timeout_secs, or check the relay.")
    )]
    Timeout { seconds: u64 },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(sonora::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration file already exists at {path}")]
    #[diagnostic(code(sonora::config_exists), help("Use --force to overwrite it."))]
    ConfigExists { path: String },

    #[error(transparent)]
    #[diagnostic(code(sonora::config), help("Check the file printed by: sonora config path"))]
    Config(Box<ConfigError>),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON payload: {0}")]
    #[diagnostic(code(sonora::json), help("Pass a JSON object, e.g. --data '{{\"zone_id\":\"z1\"}}'"))]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(Box::new(other)),
        }
    }
}

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { url, reason } => Self::ConnectionFailed { url, reason },
            CoreError::Timeout { timeout_secs } => Self::Timeout {
                seconds: timeout_secs,
            },
            CoreError::SessionExpired { .. } | CoreError::AuthorizationExpired { .. } => {
                Self::SessionExpired
            }
            CoreError::CommandRejected { command_id, cause } => Self::Rejected { command_id, cause },
            CoreError::Config { message } => Self::Validation {
                field: "relay".into(),
                reason: message,
            },
            other => Self::Relay {
                message: other.to_string(),
            },
        }
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::SessionExpired => exit_code::AUTH,
            Self::Rejected { .. } => exit_code::REJECTED,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::Json(_) | Self::ConfigExists { .. } => exit_code::USAGE,
            Self::Relay { .. } | Self::Config(_) | Self::Io(_) => exit_code::GENERAL,
        }
    }
}
