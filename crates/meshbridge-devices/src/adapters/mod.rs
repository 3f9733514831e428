//! Transport adapters.
//!
//! - `memory`: in-process mesh simulator and recording broker
//! - `mqtt`: MQTT broker client over rumqttc

pub mod memory;
#[cfg(feature = "mqtt")]
pub mod mqtt;
