//! [`LogAggregator`] – bounded ring of recent device log lines.
//!
//! The line buffer and the database-loading flag are updated together under
//! one lock so a snapshot never pairs lines from one moment with a flag from
//! another.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use picolink_middleware::{BusClient, MessageHandler};
use picolink_types::{BridgeError, BusMessage, LogSnapshot};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Lines kept when no capacity is configured.
pub const DEFAULT_CAPACITY: usize = 500;

/// Buffered live-tail lines per WebSocket client before it lags.
const TAIL_CAPACITY: usize = 256;

/// Substrings that drive the database-loading flag.
///
/// Matching is exact, case-sensitive and anywhere in the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadingMarkers {
    pub start: Vec<String>,
    pub end: Vec<String>,
}

impl Default for LoadingMarkers {
    fn default() -> Self {
        Self {
            start: vec!["--- Loading database from SD card ---".to_string()],
            end: vec![
                "Total entries loaded into local memory".to_string(),
                "Integration complete.".to_string(),
            ],
        }
    }
}

impl LoadingMarkers {
    /// Apply one line to `loading`.  The end check runs last, so a line that
    /// carries both kinds of marker leaves the flag cleared.
    fn apply(&self, line: &str, loading: &mut bool) {
        if self.start.iter().any(|m| line.contains(m.as_str())) {
            *loading = true;
        }
        if self.end.iter().any(|m| line.contains(m.as_str())) {
            *loading = false;
        }
    }
}

#[derive(Default)]
struct LogState {
    lines: VecDeque<String>,
    db_loading: bool,
}

/// Fixed-capacity log buffer plus the derived loading flag.
pub struct LogAggregator {
    capacity: usize,
    markers: LoadingMarkers,
    state: Mutex<LogState>,
    tail: broadcast::Sender<String>,
}

impl LogAggregator {
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let (tail, _) = broadcast::channel(TAIL_CAPACITY);
        Self {
            capacity: capacity.max(1),
            markers: LoadingMarkers::default(),
            state: Mutex::new(LogState::default()),
            tail,
        }
    }

    pub fn with_markers(mut self, markers: LoadingMarkers) -> Self {
        self.markers = markers;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        // `append` keeps both fields consistent at every step.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one line, evicting the oldest entries beyond capacity.
    pub fn append(&self, line: &str) {
        {
            let mut state = self.lock();
            state.lines.push_back(line.to_string());
            while state.lines.len() > self.capacity {
                state.lines.pop_front();
            }

            let was_loading = state.db_loading;
            self.markers.apply(line, &mut state.db_loading);
            if was_loading != state.db_loading {
                debug!(db_loading = state.db_loading, "database loading state changed");
            }
        }
        // No live-tail clients is a normal condition.
        let _ = self.tail.send(line.to_string());
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let state = self.lock();
        LogSnapshot {
            lines: state.lines.iter().cloned().collect(),
            db_loading: state.db_loading,
        }
    }

    pub fn is_db_loading(&self) -> bool {
        self.lock().db_loading
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver for every line appended from now on.
    pub fn subscribe_tail(&self) -> broadcast::Receiver<String> {
        self.tail.subscribe()
    }

    /// Feed every message on `topic` into this aggregator.
    ///
    /// # Errors
    ///
    /// Propagates the bus subscription error.
    pub fn attach(self: &Arc<Self>, bus: &dyn BusClient, topic: &str) -> Result<(), BridgeError> {
        let aggregator = Arc::clone(self);
        let handler: MessageHandler = Arc::new(move |message: BusMessage| {
            aggregator.append(&message.text());
        });
        bus.subscribe(topic, handler)?;
        info!(topic = %topic, capacity = self.capacity, "log aggregator attached");
        Ok(())
    }
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
