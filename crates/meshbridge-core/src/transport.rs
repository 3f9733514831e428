//! Transport interfaces presented to the reconciliation engine.
//!
//! Implementations deliver their inbound traffic by sending [`BridgeEvent`]s
//! on the [`EventSender`] they receive in `connect`; the engine never polls
//! them directly.
//!
//! [`BridgeEvent`]: crate::event::BridgeEvent

use crate::error::TransportResult;
use crate::event::EventSender;
use crate::value::{DeviceAddress, Value};
use async_trait::async_trait;

/// Mesh network driver.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &str;

    /// Connect to the controller and start emitting mesh events.
    async fn connect(&self, events: EventSender) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;

    /// Command a value on the network.
    async fn set_value(&self, address: DeviceAddress, value: Value) -> TransportResult<()>;

    /// Ask the node to report the current reading of a value again.
    async fn refresh_value(&self, address: DeviceAddress) -> TransportResult<()>;
}

/// Publish/subscribe broker client.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Short client name for logs.
    fn name(&self) -> &str;

    /// Connect and start forwarding inbound messages.
    async fn connect(&self, events: EventSender) -> TransportResult<()>;

    async fn subscribe(&self, pattern: &str) -> TransportResult<()>;

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> TransportResult<()>;

    async fn disconnect(&self) -> TransportResult<()>;
}
