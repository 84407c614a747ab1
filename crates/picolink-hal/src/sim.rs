//! In-process simulated Pico for tests and headless runs.
//!
//! A [`SimDevice`] holds a script of what the "firmware" will emit and records
//! everything written to it.  [`SimDevice::opener`] yields a [`SimOpener`]
//! that plugs into the [`SerialChannelManager`][crate::SerialChannelManager]
//! in place of a real port.
//!
//! # Example
//!
//! ```rust
//! use picolink_hal::sim::SimDevice;
//! use picolink_hal::{ReadOutcome, SerialChannelManager, SerialSettings};
//!
//! let device = SimDevice::new();
//! device.push_output("=== MAIN MENU ===\n");
//!
//! let serial = SerialChannelManager::new(SerialSettings::default(), device.opener());
//! serial.open_blocking().unwrap();
//!
//! let mut buf = [0u8; 64];
//! assert!(matches!(serial.read(&mut buf).unwrap(), ReadOutcome::Data(18)));
//! serial.write(b"5").unwrap();
//! assert_eq!(device.written(), b"5");
//! ```

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use picolink_types::BridgeError;

use crate::link::{SerialLink, SerialOpener};

/// Upper bound on how long an idle simulated read blocks.
const IDLE_READ: Duration = Duration::from_millis(2);

enum SimEvent {
    Output(Vec<u8>),
    Fault,
}

#[derive(Default)]
struct SimState {
    script: VecDeque<SimEvent>,
    written: Vec<u8>,
    open_failures: usize,
    write_failures: usize,
    opens: usize,
}

/// Shared handle to a simulated device.  Clones observe the same state.
#[derive(Clone, Default)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue bytes the device will emit on a future read.
    pub fn push_output(&self, bytes: impl Into<Vec<u8>>) {
        self.lock().script.push_back(SimEvent::Output(bytes.into()));
    }

    /// Queue a read failure, as seen when the USB cable is pulled.
    pub fn push_fault(&self) {
        self.lock().script.push_back(SimEvent::Fault);
    }

    /// Make the next `count` open attempts fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.lock().open_failures = count;
    }

    /// Make the next `count` writes fail.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().write_failures = count;
    }

    /// Everything successfully written to the device so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    /// Number of scripted events not yet consumed.
    pub fn pending(&self) -> usize {
        self.lock().script.len()
    }

    pub fn opener(&self) -> SimOpener {
        SimOpener {
            device: self.clone(),
        }
    }
}

/// [`SerialOpener`] that hands out links to a [`SimDevice`].
pub struct SimOpener {
    device: SimDevice,
}

impl SerialOpener for SimOpener {
    fn open(
        &self,
        port: &str,
        _baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn SerialLink>, BridgeError> {
        let mut state = self.device.lock();
        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err(BridgeError::io(port, "simulated open failure"));
        }
        state.opens += 1;
        Ok(Box::new(SimLink {
            device: self.device.clone(),
            idle: read_timeout.min(IDLE_READ),
        }))
    }
}

struct SimLink {
    device: SimDevice,
    idle: Duration,
}

impl Read for SimLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let next = self.device.lock().script.pop_front();
        match next {
            Some(SimEvent::Output(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                if n < bytes.len() {
                    self.device
                        .lock()
                        .script
                        .push_front(SimEvent::Output(bytes[n..].to_vec()));
                }
                Ok(n)
            }
            Some(SimEvent::Fault) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated device fault",
            )),
            None => {
                std::thread::sleep(self.idle);
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            }
        }
    }
}

impl Write for SimLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.device.lock();
        if state.write_failures > 0 {
            state.write_failures -= 1;
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            ));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(device: &SimDevice) -> Box<dyn SerialLink> {
        device
            .opener()
            .open("sim0", 115_200, Duration::from_millis(100))
            .unwrap()
    }

    #[test]
    fn scripted_output_is_split_to_fit_buffer() {
        let device = SimDevice::new();
        device.push_output("abcdef");
        let mut link = open(&device);

        let mut buf = [0u8; 4];
        assert_eq!(link.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(device.pending(), 1);
        assert_eq!(link.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(device.pending(), 0);
    }

    #[test]
    fn idle_read_times_out() {
        let device = SimDevice::new();
        let mut link = open(&device);
        let err = link.read(&mut [0u8; 8]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn open_failures_are_consumed() {
        let device = SimDevice::new();
        device.fail_next_opens(1);
        let opener = device.opener();
        assert!(opener.open("sim0", 9600, Duration::from_millis(1)).is_err());
        assert!(opener.open("sim0", 9600, Duration::from_millis(1)).is_ok());
        assert_eq!(device.opens(), 1);
    }

    #[test]
    fn writes_are_recorded_unless_failing() {
        let device = SimDevice::new();
        device.fail_next_writes(1);
        let mut link = open(&device);
        assert!(link.write_all(b"2").is_err());
        link.write_all(b"3").unwrap();
        assert_eq!(device.written(), b"3");
    }
}
