//! `picolink-hal` – serial hardware access for the Pico bridge.
//!
//! # Modules
//!
//! - [`link`] – the [`SerialLink`] / [`SerialOpener`] seam plus the
//!   `serialport`-backed opener and port enumeration.
//! - [`channel`] – [`SerialChannelManager`], the single owner of the device
//!   handle with reopen-on-fault semantics.
//! - [`sim`] – scripted in-process device for tests and headless runs.

pub mod channel;
pub mod link;
pub mod sim;

pub use channel::{ReadOutcome, SerialChannelManager, SerialSettings};
pub use link::{SerialLink, SerialOpener, SerialPortInfo, SystemSerialOpener, list_ports};
