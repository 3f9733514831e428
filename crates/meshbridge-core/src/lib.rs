//! Core types and seams for the mesh-to-MQTT bridge.
//!
//! This crate defines the data model shared by the reconciliation engine and
//! the transport adapters:
//!
//! - **Value model**: [`Value`], [`ValueType`] and [`DeviceAddress`]
//! - **Events**: [`MeshEvent`], [`BrokerMessage`] and the unified [`BridgeEvent`]
//! - **Transports**: the [`MeshTransport`] and [`BrokerClient`] traits
//! - **Configuration**: [`BridgeConfig`] loaded from TOML and validated up front

pub mod config;
pub mod error;
pub mod event;
pub mod transport;
pub mod value;

pub use config::{
    BrokerConfig, BridgeConfig, DeviceEntry, MeshConfig, MeshDriver, ReconcileSettings,
    umbrella_subscription,
};
pub use error::{ConfigError, TransportError, TransportResult};
pub use event::{BridgeEvent, BrokerMessage, EventSender, MeshEvent, MeshValue};
pub use transport::{BrokerClient, MeshTransport};
pub use value::{DeviceAddress, Value, ValueType};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Suffix of the topic a device listens on for commands.
pub const SET_SUFFIX: &str = "/set";

/// Suffix of the topic a device publishes confirmed state to.
pub const STATE_SUFFIX: &str = "/state";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
