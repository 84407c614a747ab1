use std::borrow::Cow;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;

pub use command::{CommandAction, CommandEncoder, DeviceProtocol};

/// Lifecycle of the physical serial connection owned by the channel manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No handle has been opened yet, or it was closed on shutdown.
    Closed,
    /// A handle is installed and usable.
    Open,
    /// The last I/O call failed; the handle has been released.
    Faulted,
}

/// A single message crossing the publish/subscribe bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Stamp a new message with the current UTC time.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Payload decoded as UTF-8, with invalid sequences replaced by U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Consistent view of the log buffer returned to the web façade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub lines: Vec<String>,
    pub db_loading: bool,
}

/// Error type shared by the bridge, the bus adapters and the façade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Serial I/O error on {port}: {details}")]
    TransientIo { port: String, details: String },

    #[error("Serial port {0} is not open")]
    NotConnected(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Bus error: {0}")]
    BusTransient(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP server error: {0}")]
    Server(String),

    #[error("Shutdown requested")]
    Shutdown,
}

impl BridgeError {
    pub fn io(port: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BridgeError::TransientIo {
            port: port.into(),
            details: err.to_string(),
        }
    }
}
