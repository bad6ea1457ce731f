use chrono::Local;
use crossterm::style::Stylize;
use tokio::sync::mpsc;

use super::connection::ConnectionInfo;

/// Lifecycle events that flow from the session to whoever displays them.
/// Purely informational: nothing here feeds back into the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connecting {
        url: String,
    },
    Connected {
        info: ConnectionInfo,
        reconnected: bool,
    },
    RequestForwarded {
        method: String,
        path: String,
        status: u16,
        duration_ms: u64,
    },
    RelayError {
        message: String,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
        next_retry_secs: u64,
    },
    Closed,
}

pub fn create_event_channel() -> (
    mpsc::UnboundedSender<SessionEvent>,
    mpsc::UnboundedReceiver<SessionEvent>,
) {
    mpsc::unbounded_channel()
}

/// Prints session events to stdout.
pub struct ConsoleReporter {
    rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl ConsoleReporter {
    pub fn new(rx: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        Self { rx }
    }

    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            for line in render(&event) {
                println!("{}", line);
            }
        }
    }
}

pub fn render(event: &SessionEvent) -> Vec<String> {
    match event {
        SessionEvent::Connecting { url } => {
            vec![format!("Connecting to: {}", url).grey().to_string()]
        }
        SessionEvent::Connected {
            reconnected: true, ..
        } => vec!["✅ Reconnected successfully!".green().to_string()],
        SessionEvent::Connected { info, .. } => banner(info),
        SessionEvent::RequestForwarded {
            method,
            path,
            status,
            duration_ms,
        } => {
            let status = match status {
                200..=299 => status.to_string().green(),
                300..=399 => status.to_string().cyan(),
                400..=499 => status.to_string().yellow(),
                _ => status.to_string().red(),
            };
            vec![format!(
                "{} {} {} -> {} ({}ms)",
                Local::now().format("%H:%M:%S").to_string().dark_grey(),
                method.clone().bold(),
                path,
                status,
                duration_ms
            )]
        }
        SessionEvent::RelayError { message } => {
            vec![format!("❌ Server error: {}", message).red().to_string()]
        }
        SessionEvent::Disconnected { reason } => {
            vec![format!("🔌 Tunnel connection closed ({})", reason)
                .yellow()
                .to_string()]
        }
        SessionEvent::Reconnecting { attempt } => {
            vec![format!("🔄 Attempting to reconnect (attempt {})...", attempt)
                .yellow()
                .to_string()]
        }
        SessionEvent::ReconnectFailed {
            error,
            next_retry_secs,
            ..
        } => vec![format!(
            "❌ Reconnection failed: {}, retrying in {} seconds...",
            error, next_retry_secs
        )
        .red()
        .to_string()],
        SessionEvent::Closed => vec!["✅ Tunnel closed successfully".green().to_string()],
    }
}

fn banner(info: &ConnectionInfo) -> Vec<String> {
    let rule = "━".repeat(50);
    vec![
        String::new(),
        "🚇 Rail Tunnel Active!".cyan().to_string(),
        rule.clone().green().to_string(),
        format!("{}{}", "Local URL:  ".blue(), info.local_url.clone().white()),
        format!("{}{}", "Public URL: ".blue(), info.public_url.clone().white()),
        rule.green().to_string(),
        "Press Ctrl+C to stop tunnel".yellow().to_string(),
        String::new(),
    ]
}
