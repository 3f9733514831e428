//! Value reconciliation engine for the mesh-to-MQTT bridge.
//!
//! ## Features
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `mqtt` | ✅ | MQTT broker client (rumqttc) |
//!
//! ## Architecture
//!
//! ```text
//! broker message ─→ OutboundProcessor ─→ DeviceRegistry (arm) ─→ mesh set_value
//! mesh event     ─→ InboundProcessor  ─→ DeviceRegistry (clear) ─→ broker publish
//! ```
//!
//! - **DeviceRegistry**: addressing table plus per-device pending confirmation
//! - **InboundProcessor**: stale-reading detection and confirmed-state publishing
//! - **OutboundProcessor**: payload translation and confirmation arming
//! - **Bridge**: single dispatch loop wiring both processors to the transports

pub mod adapters;
pub mod bridge;
pub mod inbound;
pub mod outbound;
pub mod registry;

pub use bridge::{Bridge, BridgeError, BridgeResult};
pub use inbound::{InboundOutcome, InboundProcessor, StateUpdate};
pub use outbound::{OutboundProcessor, SetCommand};
pub use registry::{DeviceRecord, DeviceRegistry, PendingCommand};

pub use adapters::memory::{MemoryBroker, MemoryMesh, PublishedMessage};
#[cfg(feature = "mqtt")]
pub use adapters::mqtt::MqttBroker;
