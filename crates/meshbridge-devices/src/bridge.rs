//! Bridge coordinator.
//!
//! Owns the registry, both processors and both transports, and runs the
//! single dispatch loop. Transports, refresh timers and the loop itself only
//! communicate through one `mpsc` channel of [`BridgeEvent`]s, so registry
//! state is never touched concurrently.
//!
//! Startup order: broker connect, umbrella subscribe, then mesh connect.
//! Shutdown order: broker disconnect, then mesh disconnect.

use crate::inbound::{InboundOutcome, InboundProcessor, StateUpdate};
use crate::outbound::OutboundProcessor;
use crate::registry::DeviceRegistry;
use meshbridge_core::{
    BridgeConfig, BridgeEvent, BrokerClient, BrokerMessage, ConfigError, DeviceAddress,
    EventSender, MeshEvent, MeshTransport, ReconcileSettings, TransportError,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the bridge event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Result type for bridge startup.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Startup failures. Once running, the bridge logs and absorbs errors.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Broker error: {0}")]
    Broker(#[source] TransportError),

    #[error("Mesh error: {0}")]
    Mesh(#[source] TransportError),
}

pub struct Bridge {
    registry: DeviceRegistry,
    mesh: Arc<dyn MeshTransport>,
    broker: Arc<dyn BrokerClient>,
    inbound: InboundProcessor,
    outbound: OutboundProcessor,
    subscription: String,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<BridgeEvent>,
    /// One queued refresh per stale reading, keyed by address
    refresh_timers: HashMap<DeviceAddress, Vec<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(
        registry: DeviceRegistry,
        mesh: Arc<dyn MeshTransport>,
        broker: Arc<dyn BrokerClient>,
        settings: &ReconcileSettings,
        subscription: impl Into<String>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            registry,
            mesh,
            broker,
            inbound: InboundProcessor::new(settings),
            outbound: OutboundProcessor::new(),
            subscription: subscription.into(),
            events_tx,
            events_rx,
            refresh_timers: HashMap::new(),
        }
    }

    /// Build a bridge for a loaded configuration.
    pub fn from_config(
        config: &BridgeConfig,
        mesh: Arc<dyn MeshTransport>,
        broker: Arc<dyn BrokerClient>,
    ) -> Result<Self, ConfigError> {
        let registry = DeviceRegistry::from_config(config)?;
        Ok(Self::new(
            registry,
            mesh,
            broker,
            &config.reconcile,
            config.subscription(),
        ))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Sender for injecting events into the dispatch loop.
    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    /// Connect the broker, subscribe, then connect the mesh.
    ///
    /// The mesh comes up last so that no command can arrive before the
    /// subscription is in place.
    pub async fn start(&self) -> BridgeResult<()> {
        info!("Connecting to broker via {}", self.broker.name());
        self.broker
            .connect(self.events_tx.clone())
            .await
            .map_err(BridgeError::Broker)?;
        self.broker
            .subscribe(&self.subscription)
            .await
            .map_err(BridgeError::Broker)?;
        info!("Subscribed to {}", self.subscription);

        info!("Connecting to mesh via {}", self.mesh.name());
        self.mesh
            .connect(self.events_tx.clone())
            .await
            .map_err(BridgeError::Mesh)?;

        Ok(())
    }

    /// Wait for the next event.
    pub async fn recv_event(&mut self) -> Option<BridgeEvent> {
        self.events_rx.recv().await
    }

    /// Handle every event already queued, including ones queued while
    /// handling, without waiting for new ones.
    pub async fn dispatch_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event).await;
            handled += 1;
        }
        handled
    }

    /// Dispatch events until `shutdown` resolves.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopping...");
                    break;
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }
    }

    /// Handle one event. Never fails; problems are logged.
    pub async fn handle_event(&mut self, event: BridgeEvent) {
        match event {
            BridgeEvent::Mesh(event) => self.handle_mesh_event(event).await,
            BridgeEvent::Broker(message) => self.handle_broker_message(message).await,
            BridgeEvent::RefreshDue(address) => self.handle_refresh(address).await,
        }
    }

    async fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::Connected => info!("Connected to mesh"),
            MeshEvent::NodeAdded { node_id } => info!("Node added: {}", node_id),
            MeshEvent::ScanComplete => info!("Scan complete"),
            MeshEvent::ValueAdded {
                node_id,
                command_class,
                value,
            }
            | MeshEvent::ValueChanged {
                node_id,
                command_class,
                value,
            } => {
                debug!(
                    "Value for node {} class {} instance {} index {}: {} ({})",
                    node_id, command_class, value.instance, value.index, value.value, value.value_type
                );

                let outcome =
                    self.inbound
                        .process(&mut self.registry, node_id, command_class, &value);
                match outcome {
                    InboundOutcome::Unmonitored => {}
                    InboundOutcome::Observed(update) => self.publish(update).await,
                    InboundOutcome::Confirmed { update, .. } => {
                        let address = DeviceAddress::new(
                            node_id,
                            command_class,
                            value.instance,
                            value.index,
                        );
                        self.cancel_refresh(&address);
                        self.publish(update).await;
                    }
                    InboundOutcome::Stale { address, delay, .. } => {
                        self.schedule_refresh(address, delay);
                    }
                }
            }
        }
    }

    async fn handle_broker_message(&mut self, message: BrokerMessage) {
        let Some(command) = self.outbound.process(&mut self.registry, &message) else {
            return;
        };

        // A new command supersedes any refresh still queued for the old one.
        self.cancel_refresh(&command.address);

        if let Err(e) = self
            .mesh
            .set_value(command.address, command.value.clone())
            .await
        {
            warn!("Failed to set {} to {}: {}", command.address, command.value, e);
            self.registry.clear_pending(&command.address);
        }
    }

    async fn handle_refresh(&mut self, address: DeviceAddress) {
        if let Some(timers) = self.refresh_timers.get_mut(&address) {
            timers.retain(|timer| !timer.is_finished());
            if timers.is_empty() {
                self.refresh_timers.remove(&address);
            }
        }

        if !self.registry.is_pending(&address) {
            debug!("Skipping refresh of {}, nothing pending", address);
            return;
        }

        debug!("Refreshing {}", address);
        if let Err(e) = self.mesh.refresh_value(address).await {
            warn!("Failed to refresh {}: {}", address, e);
        }
    }

    fn schedule_refresh(&mut self, address: DeviceAddress, delay: Duration) {
        let events = self.events_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(BridgeEvent::RefreshDue(address)).await;
        });

        self.refresh_timers.entry(address).or_default().push(timer);
    }

    /// Abort every refresh still queued for `address`.
    fn cancel_refresh(&mut self, address: &DeviceAddress) {
        for timer in self.refresh_timers.remove(address).into_iter().flatten() {
            timer.abort();
        }
    }

    /// Number of refresh timers that have not fired yet.
    pub fn scheduled_refreshes(&self) -> usize {
        self.refresh_timers
            .values()
            .flatten()
            .filter(|timer| !timer.is_finished())
            .count()
    }

    async fn publish(&self, update: StateUpdate) {
        if let Err(e) = self
            .broker
            .publish(&update.topic, &update.payload, update.retain)
            .await
        {
            warn!("Failed to publish {} to {}: {}", update.payload, update.topic, e);
        }
    }

    /// Disconnect both transports, best-effort.
    pub async fn shutdown(&mut self) {
        for timer in self.refresh_timers.drain().flat_map(|(_, timers)| timers) {
            timer.abort();
        }

        match self.broker.disconnect().await {
            Ok(()) => info!("Broker stopped"),
            Err(e) => warn!("Broker disconnect failed: {}", e),
        }
        match self.mesh.disconnect().await {
            Ok(()) => info!("Mesh stopped"),
            Err(e) => warn!("Mesh disconnect failed: {}", e),
        }
    }
}
