//! `picolink-cockpit` – the web façade for the Pico bridge.
//!
//! Boots a small HTTP + WebSocket server (default port `5000`) that:
//!
//! 1. **Serves** the embedded single-page UI at `/`.
//!
//! 2. **Reports** the recent device log and the SD-card database loading
//!    flag at `GET /api/logs`, backed by a [`LogAggregator`] subscribed to the
//!    log topic.
//!
//! 3. **Accepts** menu actions (`POST /api/command`) and raw input
//!    (`POST /api/send`), encodes them and publishes them to the command
//!    topic.
//!
//! 4. **Streams** new log lines to browsers over `GET /ws/logs`.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use picolink_cockpit::{FacadeContext, FacadeServer, LogAggregator};
//! use picolink_middleware::{BusClient, LocalBus};
//! use picolink_types::CommandEncoder;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus: Arc<dyn BusClient> = Arc::new(LocalBus::default());
//!     let aggregator = Arc::new(LogAggregator::new(500));
//!     aggregator.attach(bus.as_ref(), "pico/log").expect("subscribe");
//!
//!     let ctx = FacadeContext::new(aggregator, bus, CommandEncoder::default(), "pico/cmd");
//!     FacadeServer::new(Arc::new(ctx))
//!         .run()
//!         .await
//!         .expect("façade server failed");
//! }
//! ```

pub mod aggregator;
pub mod api;
pub mod server;

pub use aggregator::{LoadingMarkers, LogAggregator};
pub use api::{FacadeContext, HttpResponse, route};
pub use server::{DEFAULT_PORT, FacadeServer};
