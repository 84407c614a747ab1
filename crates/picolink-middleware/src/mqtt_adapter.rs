//! MQTT transport built on `rumqttc`.
//!
//! One task drives the `rumqttc` event loop.  Incoming publishes are routed
//! through a [`RouteTable`] to per-subscription dispatchers.  Every
//! subscription is re-issued on each `ConnAck`, so a broker restart or a
//! dropped TCP connection does not silently unsubscribe the bridge.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use picolink_types::{BridgeError, BusMessage};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    BusClient, Delivery, MessageHandler, SUBSCRIPTION_QUEUE, current_runtime, offer,
    spawn_dispatcher, subscription_channel, topic_matches,
};

/// Outstanding requests buffered between the client and the event loop.
const REQUEST_CAPACITY: usize = 100;
/// How long `shutdown` waits for the disconnect to go out.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Broker connection parameters.
#[derive(Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pause after a failed poll before the event loop tries again.
    pub reconnect_delay: Duration,
}

impl MqttConfig {
    /// Client id of the form `picolink-<uuid>`.
    pub fn generated_client_id() -> String {
        format!("picolink-{}", Uuid::new_v4().simple())
    }

    pub fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.host, self.port)
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "test.mosquitto.org".to_string(),
            port: 1883,
            keep_alive: Duration::from_secs(60),
            client_id: Self::generated_client_id(),
            username: None,
            password: None,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

struct Route {
    filter: String,
    tx: mpsc::Sender<BusMessage>,
}

/// Subscription filters and the dispatcher each one feeds.
#[derive(Default, Clone)]
struct RouteTable {
    routes: Arc<Mutex<Vec<Route>>>,
}

impl RouteTable {
    fn lock(&self) -> MutexGuard<'_, Vec<Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, filter: &str, tx: mpsc::Sender<BusMessage>) {
        self.lock().push(Route {
            filter: filter.to_string(),
            tx,
        });
    }

    fn filters(&self) -> Vec<String> {
        self.lock().iter().map(|r| r.filter.clone()).collect()
    }

    /// Hand `message` to every matching route.  Returns the number of
    /// deliveries.  Routes whose dispatcher has gone away are dropped.
    fn dispatch(&self, message: &BusMessage) -> usize {
        let mut delivered = 0;
        self.lock().retain(|route| {
            if !topic_matches(&route.filter, &message.topic) {
                return true;
            }
            match offer(&route.tx, &route.filter, message.clone()) {
                Delivery::Queued => {
                    delivered += 1;
                    true
                }
                Delivery::Dropped => true,
                Delivery::Closed => false,
            }
        });
        delivered
    }
}

/// [`BusClient`] backed by an MQTT broker.
pub struct MqttBus {
    client: AsyncClient,
    routes: RouteTable,
    runtime: Handle,
    stopping: Arc<AtomicBool>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    endpoint: String,
}

impl MqttBus {
    /// Configure the client and spawn the event-loop task.
    ///
    /// The TCP connection is made by the event loop, so this returns before
    /// the broker has answered; connection problems show up as warnings and
    /// retries.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BusTransient`] when called outside a Tokio
    /// runtime.
    pub fn connect(config: MqttConfig) -> Result<Self, BridgeError> {
        let runtime = current_runtime()?;

        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);
        if let Some(username) = &config.username {
            options.set_credentials(username, config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let routes = RouteTable::default();
        let stopping = Arc::new(AtomicBool::new(false));
        let endpoint = config.endpoint();

        let task = runtime.spawn(drive_event_loop(
            eventloop,
            client.clone(),
            routes.clone(),
            stopping.clone(),
            config.reconnect_delay,
            endpoint.clone(),
        ));

        info!(broker = %endpoint, client_id = %config.client_id, "mqtt client started");
        Ok(Self {
            client,
            routes,
            runtime,
            stopping,
            event_loop: Mutex::new(Some(task)),
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BusClient for MqttBus {
    fn publish(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
        {
            warn!(topic = %topic, error = %e, "mqtt publish failed");
        }
    }

    fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<(), BridgeError> {
        let (tx, rx) = subscription_channel(SUBSCRIPTION_QUEUE);
        self.routes.add(topic, tx);
        spawn_dispatcher(&self.runtime, topic.to_string(), rx, handler);

        // Also re-issued on every ConnAck.
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| BridgeError::BusTransient(format!("subscribe {topic}: {e}")))
    }

    async fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!(error = %e, "mqtt disconnect request not queued");
        }

        let task = self
            .event_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!(broker = %self.endpoint, "mqtt event loop did not stop in time; aborting");
                task.abort();
            }
        }
        info!(broker = %self.endpoint, "mqtt client stopped");
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    routes: RouteTable,
    stopping: Arc<AtomicBool>,
    reconnect_delay: Duration,
    endpoint: String,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                let filters = routes.filters();
                info!(broker = %endpoint, subscriptions = filters.len(), "mqtt connected");
                for filter in filters {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtMostOnce) {
                        warn!(filter = %filter, error = %e, "mqtt resubscribe failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = BusMessage::new(publish.topic.clone(), publish.payload.to_vec());
                if routes.dispatch(&message) == 0 {
                    debug!(topic = %publish.topic, "mqtt message with no local route");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(
                    broker = %endpoint,
                    error = %e,
                    retry_in_ms = reconnect_delay.as_millis() as u64,
                    "mqtt connection error"
                );
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
    debug!(broker = %endpoint, "mqtt event loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_public_broker() {
        let config = MqttConfig::default();
        assert_eq!(config.host, "test.mosquitto.org");
        assert_eq!(config.port, 1883);
        assert_eq!(config.keep_alive, Duration::from_secs(60));
        assert!(config.client_id.starts_with("picolink-"));
        assert_eq!(config.endpoint(), "mqtt://test.mosquitto.org:1883");
    }

    #[test]
    fn generated_client_ids_are_unique() {
        assert_ne!(MqttConfig::generated_client_id(), MqttConfig::generated_client_id());
    }

    #[test]
    fn debug_redacts_password() {
        let config = MqttConfig {
            username: Some("pico".to_string()),
            password: Some("hunter2".to_string()),
            ..MqttConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(rendered.contains("pico"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn route_table_dispatches_by_filter() {
        let table = RouteTable::default();
        let (log_tx, mut log_rx) = subscription_channel(8);
        let (all_tx, mut all_rx) = subscription_channel(8);
        table.add("pico/log", log_tx);
        table.add("pico/#", all_tx);

        assert_eq!(table.dispatch(&BusMessage::new("pico/log", "hello\n")), 2);
        assert_eq!(table.dispatch(&BusMessage::new("pico/cmd", "2")), 1);
        assert_eq!(table.dispatch(&BusMessage::new("other", "x")), 0);

        assert_eq!(log_rx.recv().await.unwrap().payload, b"hello\n");
        assert_eq!(all_rx.recv().await.unwrap().topic, "pico/log");
        assert_eq!(all_rx.recv().await.unwrap().topic, "pico/cmd");
        assert_eq!(table.filters(), vec!["pico/log", "pico/#"]);
    }

    #[test]
    fn route_table_drops_closed_routes() {
        let table = RouteTable::default();
        let (tx, rx) = subscription_channel(8);
        table.add("pico/log", tx);
        drop(rx);

        assert_eq!(table.dispatch(&BusMessage::new("pico/log", "x")), 0);
        assert!(table.filters().is_empty());
    }

    #[test]
    fn route_table_keeps_full_routes() {
        let table = RouteTable::default();
        let (tx, mut rx) = subscription_channel(1);
        table.add("pico/cmd", tx);

        assert_eq!(table.dispatch(&BusMessage::new("pico/cmd", "2")), 1);
        assert_eq!(table.dispatch(&BusMessage::new("pico/cmd", "3")), 0);
        assert_eq!(table.filters(), vec!["pico/cmd"]);
        assert_eq!(rx.try_recv().unwrap().payload, b"2");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_requires_runtime() {
        assert!(matches!(
            MqttBus::connect(MqttConfig::default()),
            Err(BridgeError::BusTransient(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_broker_still_shuts_down() -> Result<(), Box<dyn std::error::Error>> {
        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            reconnect_delay: Duration::from_millis(10),
            ..MqttConfig::default()
        };
        let bus = MqttBus::connect(config)?;
        bus.subscribe("pico/cmd", Arc::new(|_: BusMessage| {}))?;
        bus.publish("pico/log", b"dropped\n");

        tokio::time::timeout(Duration::from_secs(5), bus.shutdown()).await?;
        Ok(())
    }
}
