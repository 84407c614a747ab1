//! The bus adapter seam.
//!
//! The bridge and the log aggregator never speak MQTT directly.  They hold an
//! `Arc<dyn BusClient>` and the process wires in either
//! [`MqttBus`][crate::mqtt_adapter::MqttBus] or
//! [`LocalBus`][crate::bus::LocalBus].

use std::sync::Arc;

use async_trait::async_trait;
use picolink_types::{BridgeError, BusMessage};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// Messages queued per subscription before new ones are dropped.
pub(crate) const SUBSCRIPTION_QUEUE: usize = 1024;

/// Callback invoked for every message delivered to a subscription.
///
/// Handlers run on the blocking pool and may do synchronous I/O.
pub type MessageHandler = Arc<dyn Fn(BusMessage) + Send + Sync>;

/// Publish/subscribe transport used by the bridge and the façade.
///
/// # Contract
///
/// * `publish` – fire-and-forget.  Failures are logged by the implementation
///   and never surface to the caller.
///
/// * `subscribe` – registers `handler` for every message whose topic matches
///   the filter.  Calls for one subscription are serialized: the next message
///   is not handed over until the previous call has returned.
///
/// * `shutdown` – best-effort disconnect.
#[async_trait]
pub trait BusClient: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]);

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BridgeError>;

    async fn shutdown(&self) {}
}

/// MQTT topic-filter matching with `+` (one level) and `#` (rest of tree).
///
/// Topics beginning with `$` never match a filter that starts with a
/// wildcard.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Runtime the dispatcher tasks are spawned on.
pub(crate) fn current_runtime() -> Result<Handle, BridgeError> {
    Handle::try_current()
        .map_err(|e| BridgeError::BusTransient(format!("no async runtime for subscription: {e}")))
}

/// Queue feeding one subscription's dispatcher.
pub(crate) fn subscription_channel(
    capacity: usize,
) -> (mpsc::Sender<BusMessage>, mpsc::Receiver<BusMessage>) {
    mpsc::channel(capacity.max(1))
}

/// What happened to a message handed to a subscription queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    /// The queue was full; the message is gone.
    Dropped,
    /// The dispatcher has exited.
    Closed,
}

/// Queue `message` without waiting.  A full queue drops it with a warning.
pub(crate) fn offer(tx: &mpsc::Sender<BusMessage>, filter: &str, message: BusMessage) -> Delivery {
    match tx.try_send(message) {
        Ok(()) => Delivery::Queued,
        Err(TrySendError::Full(message)) => {
            warn!(filter = %filter, topic = %message.topic, "subscription queue full; message dropped");
            Delivery::Dropped
        }
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

/// Drain `rx` on one task, running `handler` to completion for each message
/// before taking the next.
pub(crate) fn spawn_dispatcher(
    runtime: &Handle,
    filter: String,
    mut rx: mpsc::Receiver<BusMessage>,
    handler: MessageHandler,
) {
    runtime.spawn(async move {
        while let Some(message) = rx.recv().await {
            let handler = handler.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || handler(message)).await {
                warn!(filter = %filter, error = %e, "message handler failed");
            }
        }
        debug!(filter = %filter, "subscription closed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_topics_match() {
        assert!(topic_matches("pico/log", "pico/log"));
        assert!(!topic_matches("pico/log", "pico/cmd"));
        assert!(!topic_matches("pico/log", "pico/log/extra"));
        assert!(!topic_matches("pico/log/extra", "pico/log"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(topic_matches("pico/+", "pico/log"));
        assert!(topic_matches("+/log", "pico/log"));
        assert!(!topic_matches("pico/+", "pico/log/raw"));
        assert!(topic_matches("pico/+/raw", "pico/log/raw"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(topic_matches("#", "pico/log"));
        assert!(topic_matches("pico/#", "pico/log/raw"));
        assert!(topic_matches("pico/#", "pico"));
        assert!(!topic_matches("pico/#", "other/log"));
    }

    #[test]
    fn system_topics_hidden_from_root_wildcards() {
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
        assert!(!topic_matches("+/broker/uptime", "$SYS/broker/uptime"));
        assert!(topic_matches("$SYS/#", "$SYS/broker/uptime"));
    }

    #[tokio::test]
    async fn dispatcher_runs_handler_per_message() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |msg: BusMessage| {
            let _ = out_tx.send(msg.text().into_owned());
        });

        let (tx, rx) = subscription_channel(SUBSCRIPTION_QUEUE);
        spawn_dispatcher(&current_runtime().unwrap(), "pico/cmd".to_string(), rx, handler);
        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "2")), Delivery::Queued);
        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "3")), Delivery::Queued);

        assert_eq!(out_rx.recv().await.unwrap(), "2");
        assert_eq!(out_rx.recv().await.unwrap(), "3");
    }

    #[tokio::test]
    async fn stalled_handler_drops_overflow_instead_of_queueing() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = std::sync::Mutex::new(release_rx);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |msg: BusMessage| {
            // Stalls like a hung serial write until the test releases it.
            let _ = release_rx.lock().unwrap().recv();
            let _ = out_tx.send(msg.text().into_owned());
        });

        let (tx, rx) = subscription_channel(2);
        spawn_dispatcher(&current_runtime().unwrap(), "pico/cmd".to_string(), rx, handler);

        // The first message is taken by the stalled handler, wait for that.
        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "1")), Delivery::Queued);
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while tx.capacity() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "2")), Delivery::Queued);
        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "3")), Delivery::Queued);
        assert_eq!(offer(&tx, "pico/cmd", BusMessage::new("pico/cmd", "4")), Delivery::Dropped);

        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert_eq!(out_rx.recv().await.unwrap(), "1");
        assert_eq!(out_rx.recv().await.unwrap(), "2");
        assert_eq!(out_rx.recv().await.unwrap(), "3");
    }

    #[test]
    fn offer_reports_closed_dispatcher() {
        let (tx, rx) = subscription_channel(4);
        drop(rx);
        assert_eq!(offer(&tx, "pico/log", BusMessage::new("pico/log", "x")), Delivery::Closed);
    }

    #[test]
    fn no_runtime_is_a_bus_error() {
        assert!(matches!(current_runtime(), Err(BridgeError::BusTransient(_))));
    }
}
