//! `picolink-middleware` – moves bytes between the Pico and the bus.
//!
//! # Modules
//!
//! - [`adapter`] – the [`BusClient`] trait every transport implements, plus
//!   MQTT topic-filter matching.
//! - [`bus`] – [`LocalBus`], an in-process broadcast bus for tests and
//!   single-process deployments.
//! - [`mqtt_adapter`] – [`MqttBus`], the `rumqttc`-backed transport.
//! - [`lines`] – byte-to-line assembly for device output.
//! - [`bridge`] – [`BridgeRelay`], the duplex pump between the serial
//!   channel and the command/log topic pair.

pub mod adapter;
pub mod bridge;
pub mod bus;
pub mod lines;
pub mod mqtt_adapter;

pub use adapter::{BusClient, MessageHandler, topic_matches};
pub use bridge::{BridgeHandle, BridgeRelay};
pub use bus::LocalBus;
pub use lines::LineAssembler;
pub use mqtt_adapter::{MqttBus, MqttConfig};
