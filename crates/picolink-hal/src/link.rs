//! Serial link abstraction.
//!
//! The channel manager never names a concrete port type.  It asks a
//! [`SerialOpener`] for a boxed [`SerialLink`] and drops the box to close it,
//! so the real `serialport` backend and the [`sim`][crate::sim] device are
//! interchangeable.

use std::io::{Read, Write};
use std::time::Duration;

use picolink_types::BridgeError;
use serde::Serialize;
use serialport::{DataBits, FlowControl, Parity, StopBits};

/// An open, bidirectional byte link to the device.
///
/// Reads must honour the timeout the link was opened with and report it as
/// [`std::io::ErrorKind::TimedOut`] (or a zero-length read).
pub trait SerialLink: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> SerialLink for T {}

/// Factory for [`SerialLink`] handles.
pub trait SerialOpener: Send + Sync {
    /// Open `port` at `baud_rate` with the given read timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::TransientIo`] when the port cannot be opened.
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, BridgeError>;
}

/// Opens real ports through the `serialport` crate (8-N-1, no flow control).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerialOpener;

impl SerialOpener for SystemSerialOpener {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, BridgeError> {
        let handle = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(read_timeout)
            .open()
            .map_err(|e| BridgeError::io(port, e))?;
        Ok(Box::new(handle))
    }
}

/// Information about an available serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

/// Enumerate the serial ports visible to the operating system.
///
/// On macOS the `/dev/tty.*` call-in devices are hidden; only the `/dev/cu.*`
/// devices are usable for outgoing connections.
pub fn list_ports() -> Result<Vec<SerialPortInfo>, BridgeError> {
    let ports = serialport::available_ports()
        .map_err(|e| BridgeError::io("<enumerate>", e))?;

    Ok(ports
        .into_iter()
        .filter(|p| !hidden_port(&p.port_name))
        .map(|p| {
            let (port_type, manufacturer, product, serial_number, vid, pid) = match p.port_type {
                serialport::SerialPortType::UsbPort(info) => (
                    "USB".to_string(),
                    info.manufacturer,
                    info.product,
                    info.serial_number,
                    Some(info.vid),
                    Some(info.pid),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::PciPort => {
                    ("PCI".to_string(), None, None, None, None, None)
                }
                serialport::SerialPortType::Unknown => {
                    ("Unknown".to_string(), None, None, None, None, None)
                }
            };
            SerialPortInfo {
                port_name: p.port_name,
                port_type,
                manufacturer,
                product,
                serial_number,
                vid,
                pid,
            }
        })
        .collect())
}

fn hidden_port(name: &str) -> bool {
    cfg!(target_os = "macos") && name.starts_with("/dev/tty.")
}
