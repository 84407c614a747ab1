//! Device command vocabulary and its wire encoding.
//!
//! The Pico firmware exposes a single-key main menu:
//!
//! | Key | Menu entry |
//! |---|---|
//! | `1` | Benchmark + CSV identification (followed by a top-N line) |
//! | `2` | Back up SPI flash to SD |
//! | `3` | Restore SPI flash from the latest image |
//! | `4` | Restore SPI flash from a named image (followed by a filename line) |
//! | `5` | List flash images |
//! | `q` | Enter idle mode |
//!
//! Two revisions of the menu exist in the field and disagree on how the image
//! listing and the idle-mode exit are spelled; [`DeviceProtocol`] selects one.

use serde::{Deserialize, Serialize};

use crate::BridgeError;

/// Smallest top-N accepted by the identification workflow.
pub const MIN_TOP_N: i64 = 1;
/// Largest top-N accepted by the identification workflow.
pub const MAX_TOP_N: i64 = 10;

/// Wire-level revision of the device menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceProtocol {
    /// Firmware menu as shipped: bare `5` lists images, `m` leaves idle mode.
    #[default]
    Classic,
    /// Later web revision: `5\n` lists images, `r` leaves idle mode.
    Revised,
}

impl std::fmt::Display for DeviceProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceProtocol::Classic => write!(f, "classic"),
            DeviceProtocol::Revised => write!(f, "revised"),
        }
    }
}

impl std::str::FromStr for DeviceProtocol {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classic" => Ok(DeviceProtocol::Classic),
            "revised" => Ok(DeviceProtocol::Revised),
            other => Err(BridgeError::Config(format!(
                "unknown device protocol {other:?} (expected \"classic\" or \"revised\")"
            ))),
        }
    }
}

/// High-level action requested by an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Run the identification workflow, optionally answering the top-N prompt.
    Identify(Option<i64>),
    Backup,
    RestoreLatest,
    RestoreChoose(String),
    ListImages,
    Quit,
    Resume,
    /// Bytes forwarded to the device untouched.
    RawSend(Vec<u8>),
}

/// Pure mapping from [`CommandAction`] to device bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandEncoder {
    protocol: DeviceProtocol,
}

impl CommandEncoder {
    pub fn new(protocol: DeviceProtocol) -> Self {
        Self { protocol }
    }

    pub fn protocol(&self) -> DeviceProtocol {
        self.protocol
    }

    /// Encode `action` into the exact byte sequence the device expects.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidInput`] when a restore filename trims to
    /// nothing or a raw payload is empty.
    pub fn encode(&self, action: &CommandAction) -> Result<Vec<u8>, BridgeError> {
        let bytes = match action {
            CommandAction::Identify(Some(n)) => {
                format!("1{}\n", (*n).clamp(MIN_TOP_N, MAX_TOP_N)).into_bytes()
            }
            CommandAction::Identify(None) => b"1".to_vec(),
            CommandAction::Backup => b"2".to_vec(),
            CommandAction::RestoreLatest => b"3".to_vec(),
            CommandAction::RestoreChoose(filename) => {
                let name = filename.trim();
                if name.is_empty() {
                    return Err(BridgeError::InvalidInput("empty filename".to_string()));
                }
                format!("4{name}\n").into_bytes()
            }
            CommandAction::ListImages => match self.protocol {
                DeviceProtocol::Classic => b"5".to_vec(),
                DeviceProtocol::Revised => b"5\n".to_vec(),
            },
            CommandAction::Quit => b"q".to_vec(),
            CommandAction::Resume => match self.protocol {
                DeviceProtocol::Classic => b"m".to_vec(),
                DeviceProtocol::Revised => b"r".to_vec(),
            },
            CommandAction::RawSend(bytes) => {
                if bytes.is_empty() {
                    return Err(BridgeError::InvalidInput("empty payload".to_string()));
                }
                bytes.clone()
            }
        };
        Ok(bytes)
    }
}
