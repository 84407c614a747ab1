//! [`SerialChannelManager`] – sole owner of the device handle.
//!
//! The raw handle lives behind one mutex and is never handed out.  The
//! device→bus pump reads through [`SerialChannelManager::read`], which hides
//! faults by reopening the port; the bus→device path writes through
//! [`SerialChannelManager::write`], which reports a fault exactly once and
//! leaves reopening to the reader.
//!
//! A faulted handle is dropped and replaced by a freshly opened one.  It is
//! never reused.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use picolink_types::{BridgeError, ConnectionState};
use tracing::{debug, info, warn};

use crate::link::{SerialLink, SerialOpener};

/// Granularity of interruptible sleeps while waiting to reopen.
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Port identity and timing knobs for a [`SerialChannelManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    /// Poll interval for reads; a read that sees no data returns after this.
    pub read_timeout: Duration,
    /// Fixed delay between failed open attempts.
    pub reconnect_backoff: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            read_timeout: Duration::from_millis(100),
            reconnect_backoff: Duration::from_secs(2),
        }
    }
}

/// Result of a single [`SerialChannelManager::read`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were placed at the front of the caller's buffer.
    Data(usize),
    /// The poll interval elapsed without data.
    Timeout,
    /// The previous handle faulted (or was missing) and a new one is open.
    Reconnected,
}

struct Channel {
    link: Option<Box<dyn SerialLink>>,
    state: ConnectionState,
}

/// Owns the serial connection and applies the reopen-on-fault policy.
pub struct SerialChannelManager {
    settings: SerialSettings,
    opener: Box<dyn SerialOpener>,
    channel: Mutex<Channel>,
    shutdown: Arc<AtomicBool>,
    generation: AtomicU64,
}

impl SerialChannelManager {
    pub fn new(settings: SerialSettings, opener: impl SerialOpener + 'static) -> Self {
        Self {
            settings,
            opener: Box::new(opener),
            channel: Mutex::new(Channel {
                link: None,
                state: ConnectionState::Closed,
            }),
            shutdown: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
        }
    }

    /// Share an externally owned shutdown flag (builder-style).
    ///
    /// Once the flag is set, [`open_blocking`][Self::open_blocking] stops
    /// retrying and returns [`BridgeError::Shutdown`].
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of handles opened so far.  Increments on every reconnect.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Open the port, retrying with a fixed backoff until it succeeds.
    ///
    /// Returns immediately when a handle is already installed.  The open call
    /// itself runs without holding the channel lock, so writers are never
    /// stalled behind a slow reopen.
    ///
    /// # Errors
    ///
    /// Only [`BridgeError::Shutdown`], once the shutdown flag is raised.
    pub fn open_blocking(&self) -> Result<(), BridgeError> {
        if self.lock().link.is_some() {
            return Ok(());
        }

        let port = &self.settings.port;
        let mut attempts: u32 = 0;
        loop {
            if self.is_shutting_down() {
                return Err(BridgeError::Shutdown);
            }
            attempts += 1;
            match self.opener.open(
                port,
                self.settings.baud_rate,
                self.settings.read_timeout,
            ) {
                Ok(link) => {
                    let mut channel = self.lock();
                    channel.link = Some(link);
                    channel.state = ConnectionState::Open;
                    drop(channel);
                    self.generation.fetch_add(1, Ordering::SeqCst);
                    info!(
                        port = %port,
                        baud_rate = self.settings.baud_rate,
                        attempts,
                        "serial port opened"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        port = %port,
                        error = %e,
                        retry_in_ms = self.settings.reconnect_backoff.as_millis() as u64,
                        "serial open failed; retrying"
                    );
                    self.sleep_unless_shutdown(self.settings.reconnect_backoff);
                }
            }
        }
    }

    /// Read whatever the device has sent, waiting at most one poll interval.
    ///
    /// Faults are absorbed: the handle is released, the reconnect backoff
    /// elapses, the port is reopened and
    /// [`ReadOutcome::Reconnected`] is returned, so a read loop built on this
    /// call never has to terminate.
    ///
    /// # Errors
    ///
    /// Only [`BridgeError::Shutdown`], when shutdown interrupts a reopen.
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome, BridgeError> {
        let result = {
            let mut channel = self.lock();
            channel.link.as_mut().map(|link| link.read(buf))
        };

        match result {
            None => {
                debug!(port = %self.settings.port, "no serial handle; reopening");
                self.open_blocking()?;
                Ok(ReadOutcome::Reconnected)
            }
            Some(Ok(0)) => Ok(ReadOutcome::Timeout),
            Some(Ok(n)) => Ok(ReadOutcome::Data(n)),
            Some(Err(e)) if is_poll_timeout(e.kind()) => Ok(ReadOutcome::Timeout),
            Some(Err(e)) => {
                warn!(
                    port = %self.settings.port,
                    error = %e,
                    retry_in_ms = self.settings.reconnect_backoff.as_millis() as u64,
                    "serial read error; reopening"
                );
                self.release(ConnectionState::Faulted);
                // A port that opens but faults on every read must not spin.
                self.sleep_unless_shutdown(self.settings.reconnect_backoff);
                self.open_blocking()?;
                Ok(ReadOutcome::Reconnected)
            }
        }
    }

    /// Write `bytes` and flush immediately.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::NotConnected`] when no handle is installed.
    /// * [`BridgeError::TransientIo`] when the write or flush fails.  The
    ///   handle is released and the next read reopens it; the write is not
    ///   retried.
    pub fn write(&self, bytes: &[u8]) -> Result<(), BridgeError> {
        let mut channel = self.lock();
        let Some(link) = channel.link.as_mut() else {
            return Err(BridgeError::NotConnected(self.settings.port.clone()));
        };

        match link.write_all(bytes).and_then(|()| link.flush()) {
            Ok(()) => Ok(()),
            Err(e) => {
                channel.link = None;
                channel.state = ConnectionState::Faulted;
                Err(BridgeError::io(&self.settings.port, e))
            }
        }
    }

    /// Best-effort close for shutdown.  Errors from the drop are ignored.
    pub fn close(&self) {
        self.release(ConnectionState::Closed);
        info!(port = %self.settings.port, "serial port closed");
    }

    fn release(&self, next: ConnectionState) {
        let mut channel = self.lock();
        channel.link = None;
        channel.state = next;
    }

    fn lock(&self) -> MutexGuard<'_, Channel> {
        // Every write to `Channel` leaves it consistent, so a poisoned lock
        // is safe to keep using.
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep_unless_shutdown(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.is_shutting_down() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
        }
    }
}

fn is_poll_timeout(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}
