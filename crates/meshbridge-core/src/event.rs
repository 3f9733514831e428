//! Events delivered by the transports to the bridge dispatch loop.
//!
//! Both transports push onto the same channel so that mesh events, broker
//! messages and refresh timers are handled strictly one at a time.

use crate::value::{DeviceAddress, Value, ValueType};
use tokio::sync::mpsc;

/// Sending half of the bridge event channel, handed to transports on connect.
pub type EventSender = mpsc::Sender<BridgeEvent>;

/// A value as reported by the mesh driver.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshValue {
    pub instance: u8,
    pub index: u16,
    pub value_type: ValueType,
    pub value: Value,
}

impl MeshValue {
    pub fn new(instance: u8, index: u16, value_type: ValueType, value: impl Into<Value>) -> Self {
        Self {
            instance,
            index,
            value_type,
            value: value.into(),
        }
    }
}

/// Event emitted by the mesh transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Driver is connected to the controller
    Connected,

    /// A node joined or was found during the initial scan
    NodeAdded { node_id: u8 },

    /// A value was discovered on a node
    ValueAdded {
        node_id: u8,
        command_class: u8,
        value: MeshValue,
    },

    /// A known value reported a new reading
    ValueChanged {
        node_id: u8,
        command_class: u8,
        value: MeshValue,
    },

    /// Initial network scan finished
    ScanComplete,
}

impl MeshEvent {
    /// Address and value carried by value events.
    pub fn value(&self) -> Option<(DeviceAddress, &MeshValue)> {
        match self {
            Self::ValueAdded {
                node_id,
                command_class,
                value,
            }
            | Self::ValueChanged {
                node_id,
                command_class,
                value,
            } => Some((
                DeviceAddress::new(*node_id, *command_class, value.instance, value.index),
                value,
            )),
            _ => None,
        }
    }
}

/// Inbound broker message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Payload decoded as UTF-8, lossily.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Everything the dispatch loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Mesh(MeshEvent),
    Broker(BrokerMessage),
    /// A delayed refresh for a stale reading is due
    RefreshDue(DeviceAddress),
}

impl From<MeshEvent> for BridgeEvent {
    fn from(event: MeshEvent) -> Self {
        BridgeEvent::Mesh(event)
    }
}

impl From<BrokerMessage> for BridgeEvent {
    fn from(message: BrokerMessage) -> Self {
        BridgeEvent::Broker(message)
    }
}
