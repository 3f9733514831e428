//! MQTT broker client using rumqttc.
//!
//! Inbound publishes are forwarded to the bridge event channel from a
//! background task that drives the rumqttc event loop. The task reconnects
//! on connection errors and restores the subscriptions after every
//! reconnect, since the broker may have dropped the session.

use async_trait::async_trait;
use meshbridge_core::{
    BrokerClient, BrokerConfig, BrokerMessage, EventSender, TransportError, TransportResult,
};
use rumqttc::{AsyncClient, Event, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Delay between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Hand an inbound publish to the dispatch loop. Returns false once the
/// channel is closed.
///
/// Never waits: the loop may itself be waiting on this task to flush a
/// publish, so a full channel drops the message instead.
fn forward(events: &EventSender, message: BrokerMessage) -> bool {
    match events.try_send(message.into()) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!("Event channel full, dropping {:?}", event);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Request channel capacity of the rumqttc client.
const REQUEST_CAPACITY: usize = 10;

/// MQTT broker client.
pub struct MqttBroker {
    config: BrokerConfig,
    /// Client handle (when connected)
    client: RwLock<Option<AsyncClient>>,
    /// Patterns to restore after a reconnect
    subscriptions: Arc<RwLock<Vec<String>>>,
    /// Set once disconnect has been requested
    stopping: Arc<AtomicBool>,
}

impl MqttBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id_or_default(),
            &self.config.host,
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(self.config.clean_session);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        options
    }

    async fn client(&self) -> TransportResult<AsyncClient> {
        self.client
            .read()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl BrokerClient for MqttBroker {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn connect(&self, events: EventSender) -> TransportResult<()> {
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        self.stopping.store(false, Ordering::SeqCst);
        *self.client.write().await = Some(client.clone());

        let broker_addr = self.config.broker_addr();
        let subscriptions = self.subscriptions.clone();
        let stopping = self.stopping.clone();
        info!("Connecting to mqtt://{}", broker_addr);

        tokio::spawn(async move {
            let mut connected_once = false;

            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = BrokerMessage::new(publish.topic, publish.payload.to_vec());
                        if !forward(&events, message) {
                            debug!("Event channel closed, stopping mqtt event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to mqtt broker {}", broker_addr);
                        if connected_once {
                            for pattern in subscriptions.read().await.iter() {
                                if let Err(e) = client.try_subscribe(pattern.as_str(), QoS::AtLeastOnce) {
                                    warn!("Failed to restore subscription {}: {}", pattern, e);
                                }
                            }
                        }
                        connected_once = true;
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("Mqtt disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if stopping.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("Mqtt connection error ({}): {}", broker_addr, e);
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<()> {
        let client = self.client().await?;
        client
            .subscribe(pattern, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Communication(format!("Subscribe failed: {}", e)))?;
        self.subscriptions.write().await.push(pattern.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> TransportResult<()> {
        let client = self.client().await?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload.as_bytes().to_vec())
            .await
            .map_err(|e| TransportError::Communication(format!("Publish failed: {}", e)))
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let Some(client) = self.client.write().await.take() else {
            return Ok(());
        };
        client
            .disconnect()
            .await
            .map_err(|e| TransportError::Communication(format!("Disconnect failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::BridgeEvent;

    #[tokio::test]
    async fn test_not_connected() {
        let broker = MqttBroker::new(BrokerConfig::new("localhost"));
        assert!(matches!(
            broker.publish("a/state", "ON", true).await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            broker.subscribe("a/#").await,
            Err(TransportError::NotConnected)
        ));
        assert!(broker.disconnect().await.is_ok());
    }

    #[test]
    fn test_options_from_config() {
        let broker = MqttBroker::new(
            BrokerConfig::new("broker.local")
                .with_port(1884)
                .with_client_id("bridge")
                .with_auth("user", "pass"),
        );
        let options = broker.options();
        assert_eq!(options.client_id(), "bridge");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_forward_never_waits_on_full_channel() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(1);

        assert!(forward(&tx, BrokerMessage::new("a/set", "ON")));
        // Full: dropped, but the poll loop keeps running.
        assert!(forward(&tx, BrokerMessage::new("a/set", "OFF")));
        assert_eq!(
            rx.recv().await,
            Some(BridgeEvent::Broker(BrokerMessage::new("a/set", "ON")))
        );
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!forward(&tx, BrokerMessage::new("a/set", "ON")));
    }
}
