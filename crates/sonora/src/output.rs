//! Line-oriented rendering of relay events and command results.

use std::io::{self, IsTerminal, Write};

use owo_colors::OwoColorize;

use sonora_api::{CommandNotification, CommandState, RelayEvent, UpstreamPhase};
use sonora_core::ConnectionStatus;

use crate::cli::{ColorMode, OutputFormat};

/// Determine whether color output should be enabled.
pub fn should_color(mode: ColorMode) -> bool {
    match mode {
        ColorMode::Always => true,
        ColorMode::Never => false,
        ColorMode::Auto => io::stdout().is_terminal() && std::env::var("NO_COLOR").is_err(),
    }
}

/// Renders one line per item in the selected format.
#[derive(Debug, Clone, Copy)]
pub struct Printer {
    pub format: OutputFormat,
    pub color: bool,
    pub quiet: bool,
}

impl Printer {
    pub fn print(&self, line: &str) {
        if self.quiet || line.is_empty() {
            return;
        }
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }

    pub fn event(&self, event: &RelayEvent) {
        self.print(&self.render_event(event));
    }

    pub fn status(&self, status: &ConnectionStatus) {
        let line = match self.format {
            OutputFormat::Json => serde_json::json!({
                "event": "status",
                "data": status_label(status),
                "client_id": match status {
                    ConnectionStatus::Started { client_id } => Some(client_id.as_str()),
                    _ => None,
                },
            })
            .to_string(),
            OutputFormat::Text => {
                let label = format!("{:<13}", "status");
                format!("{} {}", self.paint_name(&label), status_text(status))
            }
        };
        self.print(&line);
    }

    pub fn render_event(&self, event: &RelayEvent) -> String {
        match self.format {
            OutputFormat::Json => {
                let data = event.data().unwrap_or_else(|_| "null".into());
                format!("{{\"event\":\"{}\",\"data\":{data}}}", event.name())
            }
            OutputFormat::Text => {
                let label = format!("{:<13}", event.name());
                format!("{} {}", self.paint_name(&label), describe(event))
            }
        }
    }

    pub fn render_outcome(&self, notification: &CommandNotification) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string(notification).unwrap_or_default(),
            OutputFormat::Text => {
                let state = match (notification.state, self.color) {
                    (CommandState::Applied, true) => "applied".green().to_string(),
                    (CommandState::Rejected, true) => "rejected".red().to_string(),
                    (CommandState::Applied, false) => "applied".to_string(),
                    (CommandState::Rejected, false) => "rejected".to_string(),
                };
                format!("{} {state}", notification.command_id)
            }
        }
    }

    fn paint_name(&self, name: &str) -> String {
        if self.color {
            name.cyan().bold().to_string()
        } else {
            name.to_string()
        }
    }
}

fn status_label(status: &ConnectionStatus) -> &'static str {
    match status {
        ConnectionStatus::NotStarted => "not_started",
        ConnectionStatus::Outdated => "outdated",
        ConnectionStatus::Started { .. } => "started",
    }
}

fn status_text(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::Started { client_id } => format!("started as {client_id}"),
        other => status_label(other).replace('_', " "),
    }
}

/// Human-readable summary of one event.
fn describe(event: &RelayEvent) -> String {
    match event {
        RelayEvent::State(state) if state.state == UpstreamPhase::Sync => {
            let zones: Vec<&str> = state.zones.iter().map(|z| z.display_name.as_str()).collect();
            format!("{} ({})", state.state, zones.join(", "))
        }
        RelayEvent::State(state) => state.state.to_string(),
        RelayEvent::CommandState(n) => {
            let state = match n.state {
                CommandState::Applied => "applied".to_string(),
                CommandState::Rejected => {
                    format!("rejected: {}", n.cause.as_deref().unwrap_or("no cause given"))
                }
            };
            format!("{} {state}", n.command_id)
        }
        RelayEvent::Zone(zone) => {
            let playback = serde_json::to_value(zone.state)
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_default();
            format!("{} [{}] {playback}", zone.display_name, zone.zone_id)
        }
        RelayEvent::Queue(queue) => format!("{} ({} items)", queue.zone_id, queue.total),
        RelayEvent::Ping(hb) => format!("every {}s", hb.interval_seconds),
        RelayEvent::Config(config) => {
            let keys: Vec<&str> = config.settings.keys().map(String::as_str).collect();
            format!("{{{}}}", keys.join(", "))
        }
    }
}
