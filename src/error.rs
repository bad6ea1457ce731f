use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::protocol::DecodeError;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error("Connection timeout after {0:?} - check server URL and network")]
    ConnectTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Local request failed: {0}")]
    LocalForward(#[from] reqwest::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Server error: {0}")]
    Relay(String),

    #[error("Invalid relay URL '{url}': {reason}")]
    InvalidRelayUrl { url: String, reason: String },

    #[error("Invalid local host '{host}': {reason}")]
    InvalidLocalHost { host: String, reason: String },

    #[error("Tunnel session is already active")]
    AlreadyActive,

    #[error("Tunnel session is closed")]
    SessionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
