//! Duplex relay between the serial channel and the bus topic pair.
//!
//! [`BridgeRelay`] runs two independent pumps that share only the
//! [`SerialChannelManager`]:
//!
//! 1. **Device → bus** – a dedicated OS thread reads the port, assembles
//!    lines and publishes each one to the log topic in read order.
//!
//! 2. **Bus → device** – the command-topic subscription handler writes each
//!    payload straight to the port.  A failed write is logged and dropped.
//!
//! Neither pump ever stops on an I/O error.  Only the shutdown flag ends the
//! device thread.

use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use picolink_hal::{ReadOutcome, SerialChannelManager};
use picolink_types::{BridgeError, BusMessage};
use tracing::{debug, info, warn};

use crate::adapter::{BusClient, MessageHandler};
use crate::lines::LineAssembler;

/// Pause after a read that saw no data.
const IDLE_YIELD: Duration = Duration::from_millis(10);
/// Size of each read from the port.
const READ_CHUNK: usize = 1024;

/// Context object for one bridge process.
pub struct BridgeRelay {
    serial: Arc<SerialChannelManager>,
    bus: Arc<dyn BusClient>,
    command_topic: String,
    log_topic: String,
    echo: bool,
    shutdown: Arc<AtomicBool>,
}

impl BridgeRelay {
    pub fn new(
        serial: Arc<SerialChannelManager>,
        bus: Arc<dyn BusClient>,
        command_topic: impl Into<String>,
        log_topic: impl Into<String>,
    ) -> Self {
        Self {
            serial,
            bus,
            command_topic: command_topic.into(),
            log_topic: log_topic.into(),
            echo: false,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Mirror every device line to stdout.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Share the process-wide shutdown flag.  Pass the same flag to the
    /// [`SerialChannelManager`] so a pending reopen is abandoned too.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn log_topic(&self) -> &str {
        &self.log_topic
    }

    /// Subscribe the command handler and spawn the `device-pump` thread.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::BusTransient`] when the command subscription cannot
    ///   be registered.
    /// * [`BridgeError::TransientIo`] when the pump thread cannot be spawned.
    pub fn start(self: Arc<Self>) -> Result<BridgeHandle, BridgeError> {
        let handler = self.command_handler();
        self.bus.subscribe(&self.command_topic, handler)?;

        let relay = self.clone();
        let thread = std::thread::Builder::new()
            .name("device-pump".to_string())
            .spawn(move || relay.pump_device_output())
            .map_err(|e| BridgeError::io(&self.serial.settings().port, e))?;

        info!(
            port = %self.serial.settings().port,
            command_topic = %self.command_topic,
            log_topic = %self.log_topic,
            "bridge started"
        );
        Ok(BridgeHandle {
            shutdown: self.shutdown.clone(),
            thread: Some(thread),
        })
    }

    fn command_handler(&self) -> MessageHandler {
        let serial = self.serial.clone();
        Arc::new(move |message: BusMessage| {
            let command = message.text();
            debug!(topic = %message.topic, command = %command.escape_debug(), "command received");
            if let Err(e) = serial.write(command.as_bytes()) {
                warn!(error = %e, "command dropped: serial write failed");
            }
        })
    }

    fn pump_device_output(&self) {
        let mut assembler = LineAssembler::new();
        let mut buf = [0u8; READ_CHUNK];

        while !self.shutdown.load(Ordering::SeqCst) {
            match self.serial.read(&mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    for line in assembler.push(&buf[..n]) {
                        self.emit_line(&line);
                    }
                }
                Ok(ReadOutcome::Timeout) => {
                    if let Some(partial) = assembler.flush() {
                        self.emit_line(&partial);
                    }
                    std::thread::sleep(IDLE_YIELD);
                }
                Ok(ReadOutcome::Reconnected) => {
                    if let Some(partial) = assembler.flush() {
                        self.emit_line(&partial);
                    }
                    info!(port = %self.serial.settings().port, "device connection resumed");
                }
                Err(BridgeError::Shutdown) => break,
                Err(e) => {
                    warn!(error = %e, "unexpected serial read error");
                    std::thread::sleep(IDLE_YIELD);
                }
            }
        }

        if let Some(partial) = assembler.flush() {
            self.emit_line(&partial);
        }
        debug!("device pump stopped");
    }

    fn emit_line(&self, raw: &[u8]) {
        let text = String::from_utf8_lossy(raw);
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
        self.bus.publish(&self.log_topic, text.as_bytes());
    }
}

/// Running bridge.  Dropping it without [`stop`][Self::stop] leaves the pump
/// running until the shared shutdown flag is raised elsewhere.
pub struct BridgeHandle {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BridgeHandle {
    /// Raise the shutdown flag and wait for the pump thread to exit.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("device pump panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }
}
