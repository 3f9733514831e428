//! In-process transports.
//!
//! [`MemoryMesh`] simulates a mesh network holding one value per address,
//! including the stale-echo behaviour of real nodes: after a command, the
//! first `stale_echoes` reports still carry the previous value. It backs the
//! `run` command and the tests.
//!
//! [`MemoryBroker`] records subscriptions and publishes and lets tests inject
//! inbound messages.

use async_trait::async_trait;
use meshbridge_core::{
    BrokerClient, BrokerMessage, DeviceAddress, DeviceEntry, EventSender, MeshEvent, MeshTransport,
    MeshValue, TransportError, TransportResult, Value, ValueType,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

const SWITCH_BINARY: u8 = 37;
const SWITCH_MULTILEVEL: u8 = 38;
const SENSOR_MULTILEVEL: u8 = 49;

/// Command received by the simulated mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshCommand {
    Set(DeviceAddress, Value),
    Refresh(DeviceAddress),
}

#[derive(Debug)]
struct SimulatedValue {
    value_type: ValueType,
    current: Value,
    /// Previous value and how many more reports will still carry it
    stale: Option<(Value, u32)>,
}

impl SimulatedValue {
    /// Value to put in the next report.
    fn report(&mut self) -> Value {
        match self.stale.take() {
            Some((previous, remaining)) if remaining > 0 => {
                if remaining > 1 {
                    self.stale = Some((previous.clone(), remaining - 1));
                }
                previous
            }
            _ => self.current.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct MeshState {
    values: BTreeMap<DeviceAddress, SimulatedValue>,
    events: Option<EventSender>,
    commands: Vec<MeshCommand>,
}

/// Simulated mesh network.
#[derive(Debug, Default)]
pub struct MemoryMesh {
    state: Mutex<MeshState>,
    stale_echoes: u32,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed one value per configured device, typed after its command class.
    pub fn for_devices<'a>(devices: impl IntoIterator<Item = &'a DeviceEntry>) -> Self {
        devices.into_iter().fold(Self::new(), |mesh, device| {
            let (value_type, value) = match device.address.command_class {
                SWITCH_BINARY => (ValueType::Bool, Value::Bool(false)),
                SWITCH_MULTILEVEL => (ValueType::Byte, Value::Number(0.0)),
                SENSOR_MULTILEVEL => (ValueType::Decimal, Value::Number(0.0)),
                _ => (ValueType::Int, Value::Number(0.0)),
            };
            mesh.with_value(device.address, value_type, value)
        })
    }

    pub fn with_value(
        self,
        address: DeviceAddress,
        value_type: ValueType,
        value: impl Into<Value>,
    ) -> Self {
        self.state.lock().values.insert(
            address,
            SimulatedValue {
                value_type,
                current: value.into(),
                stale: None,
            },
        );
        self
    }

    /// Number of stale reports each node sends after a command.
    pub fn with_stale_echoes(mut self, stale_echoes: u32) -> Self {
        self.stale_echoes = stale_echoes;
        self
    }

    /// Commands received so far.
    pub fn commands(&self) -> Vec<MeshCommand> {
        self.state.lock().commands.clone()
    }

    /// Current (settled) value of an address.
    pub fn value(&self, address: &DeviceAddress) -> Option<Value> {
        self.state
            .lock()
            .values
            .get(address)
            .map(|v| v.current.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Change a value as if operated locally and report it.
    pub async fn report(
        &self,
        address: DeviceAddress,
        value: impl Into<Value>,
    ) -> TransportResult<()> {
        let (events, event) = {
            let mut state = self.state.lock();
            let events = state.events.clone().ok_or(TransportError::NotConnected)?;
            let simulated = state
                .values
                .get_mut(&address)
                .ok_or_else(|| unknown_value(&address))?;
            simulated.current = value.into();
            simulated.stale = None;
            let event = changed(address, simulated.value_type, simulated.current.clone());
            (events, event)
        };
        send(&events, event).await
    }

    /// Sender plus a value-changed event for the next report of `address`.
    fn next_report(
        &self,
        command: MeshCommand,
        update: impl FnOnce(&mut SimulatedValue, u32),
    ) -> TransportResult<(EventSender, MeshEvent)> {
        let address = match &command {
            MeshCommand::Set(address, _) | MeshCommand::Refresh(address) => *address,
        };

        let mut state = self.state.lock();
        let events = state.events.clone().ok_or(TransportError::NotConnected)?;
        state.commands.push(command);

        let simulated = state
            .values
            .get_mut(&address)
            .ok_or_else(|| unknown_value(&address))?;
        update(simulated, self.stale_echoes);
        let reported = simulated.report();

        Ok((events, changed(address, simulated.value_type, reported)))
    }
}

fn unknown_value(address: &DeviceAddress) -> TransportError {
    TransportError::Communication(format!("no value at {}", address))
}

fn changed(address: DeviceAddress, value_type: ValueType, value: Value) -> MeshEvent {
    MeshEvent::ValueChanged {
        node_id: address.node_id,
        command_class: address.command_class,
        value: MeshValue::new(address.instance, address.index, value_type, value),
    }
}

async fn send(events: &EventSender, event: MeshEvent) -> TransportResult<()> {
    events
        .send(event.into())
        .await
        .map_err(|_| TransportError::Communication("event channel closed".to_string()))
}

/// Queue a report from inside the dispatch loop without waiting on it.
fn try_send(events: &EventSender, event: MeshEvent) -> TransportResult<()> {
    events.try_send(event.into()).map_err(|e| match e {
        TrySendError::Full(_) => TransportError::Communication("event channel full".to_string()),
        TrySendError::Closed(_) => {
            TransportError::Communication("event channel closed".to_string())
        }
    })
}

/// Coerce a commanded value to the storage type of the simulated value.
fn coerce(value: Value, value_type: ValueType) -> Value {
    match value_type {
        ValueType::Bool => match value.as_number() {
            Some(n) => Value::Bool(n != 0.0),
            None => value,
        },
        ValueType::Byte | ValueType::Decimal | ValueType::Int | ValueType::Short => {
            match value.as_number() {
                Some(n) => Value::Number(n),
                None => value,
            }
        }
        _ => value,
    }
}

#[async_trait]
impl MeshTransport for MemoryMesh {
    fn name(&self) -> &str {
        "simulated mesh"
    }

    async fn connect(&self, events: EventSender) -> TransportResult<()> {
        let announcements = {
            let mut state = self.state.lock();
            state.events = Some(events.clone());

            let nodes: BTreeSet<u8> = state.values.keys().map(|a| a.node_id).collect();
            let mut announcements = vec![MeshEvent::Connected];
            announcements.extend(
                nodes
                    .into_iter()
                    .map(|node_id| MeshEvent::NodeAdded { node_id }),
            );
            announcements.extend(state.values.iter().map(|(address, simulated)| {
                MeshEvent::ValueAdded {
                    node_id: address.node_id,
                    command_class: address.command_class,
                    value: MeshValue::new(
                        address.instance,
                        address.index,
                        simulated.value_type,
                        simulated.current.clone(),
                    ),
                }
            }));
            announcements.push(MeshEvent::ScanComplete);
            announcements
        };

        for event in announcements {
            send(&events, event).await?;
        }
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.state.lock().events = None;
        Ok(())
    }

    async fn set_value(&self, address: DeviceAddress, value: Value) -> TransportResult<()> {
        debug!("Simulated set {} = {}", address, value);
        let (events, event) =
            self.next_report(MeshCommand::Set(address, value.clone()), |simulated, echoes| {
                let previous = simulated.current.clone();
                simulated.current = coerce(value, simulated.value_type);
                simulated.stale = (echoes > 0).then_some((previous, echoes));
            })?;
        try_send(&events, event)
    }

    async fn refresh_value(&self, address: DeviceAddress) -> TransportResult<()> {
        debug!("Simulated refresh {}", address);
        let (events, event) = self.next_report(MeshCommand::Refresh(address), |_, _| {})?;
        try_send(&events, event)
    }
}

/// A publish recorded by [`MemoryBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    events: Option<EventSender>,
    subscriptions: Vec<String>,
    published: Vec<PublishedMessage>,
}

/// Recording broker client.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Publishes recorded on `topic`.
    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().events.is_some()
    }

    /// Deliver an inbound message as if another client had published it.
    pub async fn inject(&self, topic: &str, payload: &str) -> TransportResult<()> {
        let events = self
            .state
            .lock()
            .events
            .clone()
            .ok_or(TransportError::NotConnected)?;
        events
            .send(BrokerMessage::new(topic, payload).into())
            .await
            .map_err(|_| TransportError::Communication("event channel closed".to_string()))
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn name(&self) -> &str {
        "memory broker"
    }

    async fn connect(&self, events: EventSender) -> TransportResult<()> {
        self.state.lock().events = Some(events);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.subscriptions.push(pattern.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str, retain: bool) -> TransportResult<()> {
        let mut state = self.state.lock();
        if state.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.state.lock().events = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::BridgeEvent;
    use tokio::sync::mpsc;

    const RELAY: DeviceAddress = DeviceAddress::new(2, 37, 3, 0);

    async fn drain(rx: &mut mpsc::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn reported(event: &BridgeEvent) -> Option<Value> {
        match event {
            BridgeEvent::Mesh(MeshEvent::ValueChanged { value, .. }) => Some(value.value.clone()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_connect_announces_network() {
        let mesh = MemoryMesh::new()
            .with_value(RELAY, ValueType::Bool, false)
            .with_value(DeviceAddress::new(2, 37, 2, 0), ValueType::Bool, true);
        let (tx, mut rx) = mpsc::channel(16);

        mesh.connect(tx).await.unwrap();
        let events = drain(&mut rx).await;

        assert_eq!(events.first(), Some(&BridgeEvent::Mesh(MeshEvent::Connected)));
        assert_eq!(events.last(), Some(&BridgeEvent::Mesh(MeshEvent::ScanComplete)));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BridgeEvent::Mesh(MeshEvent::NodeAdded { .. })))
                .count(),
            1
        );
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, BridgeEvent::Mesh(MeshEvent::ValueAdded { .. })))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_stale_echo_then_settled_value() {
        let mesh = MemoryMesh::new()
            .with_value(RELAY, ValueType::Bool, false)
            .with_stale_echoes(1);
        let (tx, mut rx) = mpsc::channel(16);
        mesh.connect(tx).await.unwrap();
        drain(&mut rx).await;

        mesh.set_value(RELAY, Value::Number(1.0)).await.unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(reported(&events[0]), Some(Value::Bool(false)));
        assert_eq!(mesh.value(&RELAY), Some(Value::Bool(true)));

        mesh.refresh_value(RELAY).await.unwrap();
        let events = drain(&mut rx).await;
        assert_eq!(reported(&events[0]), Some(Value::Bool(true)));

        assert_eq!(
            mesh.commands(),
            vec![
                MeshCommand::Set(RELAY, Value::Number(1.0)),
                MeshCommand::Refresh(RELAY)
            ]
        );
    }

    #[tokio::test]
    async fn test_set_value_does_not_wait_on_full_channel() {
        let mesh = MemoryMesh::new().with_value(RELAY, ValueType::Bool, false);
        let (tx, mut rx) = mpsc::channel(1);
        mesh.state.lock().events = Some(tx.clone());
        tx.send(BridgeEvent::Mesh(MeshEvent::Connected)).await.unwrap();

        assert!(matches!(
            mesh.set_value(RELAY, Value::Bool(true)).await,
            Err(TransportError::Communication(_))
        ));
        // The command itself still reached the network.
        assert_eq!(mesh.value(&RELAY), Some(Value::Bool(true)));

        drain(&mut rx).await;
        mesh.refresh_value(RELAY).await.unwrap();
        assert_eq!(reported(&drain(&mut rx).await[0]), Some(Value::Bool(true)));
    }

    #[tokio::test]
    async fn test_unknown_value_and_disconnected_errors() {
        let mesh = MemoryMesh::new().with_value(RELAY, ValueType::Bool, false);
        assert!(matches!(
            mesh.set_value(RELAY, Value::Bool(true)).await,
            Err(TransportError::NotConnected)
        ));

        let (tx, _rx) = mpsc::channel(16);
        mesh.connect(tx).await.unwrap();
        assert!(matches!(
            mesh.refresh_value(DeviceAddress::new(9, 37, 1, 0)).await,
            Err(TransportError::Communication(_))
        ));
    }

    #[test]
    fn test_for_devices_types_by_command_class() {
        let devices = [
            DeviceEntry::new(RELAY, "relay", "home/relay"),
            DeviceEntry::new(DeviceAddress::new(4, 49, 1, 1), "temp", "home/temp"),
        ];
        let mesh = MemoryMesh::for_devices(&devices);
        assert_eq!(mesh.value(&RELAY), Some(Value::Bool(false)));
        assert_eq!(
            mesh.value(&DeviceAddress::new(4, 49, 1, 1)),
            Some(Value::Number(0.0))
        );
    }

    #[tokio::test]
    async fn test_memory_broker_records_and_injects() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("a/state", "ON", true).await.is_err());

        let (tx, mut rx) = mpsc::channel(16);
        broker.connect(tx).await.unwrap();
        broker.subscribe("a/#").await.unwrap();
        broker.publish("a/state", "ON", true).await.unwrap();
        broker.inject("a/set", "OFF").await.unwrap();

        assert_eq!(broker.subscriptions(), vec!["a/#".to_string()]);
        assert_eq!(
            broker.published_to("a/state"),
            vec![PublishedMessage {
                topic: "a/state".to_string(),
                payload: "ON".to_string(),
                retain: true,
            }]
        );
        assert_eq!(
            rx.recv().await,
            Some(BridgeEvent::Broker(BrokerMessage::new("a/set", "OFF")))
        );
    }
}
