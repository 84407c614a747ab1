//! In-process publish/subscribe bus.
//!
//! Uses one [`tokio::sync::broadcast`] channel for all traffic.  Each
//! subscription owns a receiver, filters by MQTT topic pattern and feeds a
//! single dispatcher, so [`LocalBus`] behaves like a broker-backed bus without
//! leaving the process.

use async_trait::async_trait;
use picolink_types::{BridgeError, BusMessage};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::adapter::{
    BusClient, Delivery, MessageHandler, SUBSCRIPTION_QUEUE, current_runtime, offer,
    spawn_dispatcher, subscription_channel, topic_matches,
};

/// Default channel capacity (messages buffered before slow subscribers lag).
const DEFAULT_CAPACITY: usize = 1024;

/// Shared in-process bus.  Clone it cheaply – all clones share one channel.
#[derive(Clone, Debug)]
pub struct LocalBus {
    sender: broadcast::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl BusClient for LocalBus {
    fn publish(&self, topic: &str, payload: &[u8]) {
        // No receivers is a normal condition.
        if self.sender.send(BusMessage::new(topic, payload)).is_err() {
            trace!(topic = %topic, "no local subscribers");
        }
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BridgeError> {
        let runtime = current_runtime()?;
        // Take the receiver now so nothing published after this call is missed.
        let mut receiver = self.sender.subscribe();
        let (tx, rx) = subscription_channel(SUBSCRIPTION_QUEUE);
        let filter = topic.to_string();

        spawn_dispatcher(&runtime, filter.clone(), rx, handler);
        runtime.spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(message) if topic_matches(&filter, &message.topic) => {
                        if offer(&tx, &filter, message) == Delivery::Closed {
                            break;
                        }
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(filter = %filter, lagged_by = n, "local subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(())
    }
}
