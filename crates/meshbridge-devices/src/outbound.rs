//! Outbound commands: broker `set` requests to mesh commands.
//!
//! The processor never publishes state itself. Publication waits until the
//! inbound side observes the commanded value (or gives up waiting).

use crate::registry::DeviceRegistry;
use meshbridge_core::{BrokerMessage, DeviceAddress, Value, SET_SUFFIX};
use tracing::{debug, info};

/// A mesh command produced from a broker message.
#[derive(Debug, Clone, PartialEq)]
pub struct SetCommand {
    pub address: DeviceAddress,
    pub value: Value,
}

/// Translates `<topic>/set` messages and arms confirmation tracking.
#[derive(Debug, Clone, Default)]
pub struct OutboundProcessor;

impl OutboundProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Resolve `message` to a command and arm the pending confirmation for it.
    ///
    /// Returns `None` for messages that are not a `set` request for a bridged
    /// device; those leave the registry untouched.
    pub fn process(
        &self,
        registry: &mut DeviceRegistry,
        message: &BrokerMessage,
    ) -> Option<SetCommand> {
        let Some(stem) = message.topic.strip_suffix(SET_SUFFIX) else {
            debug!("Ignoring message on {}", message.topic);
            return None;
        };

        let Some(record) = registry.lookup_by_topic(stem) else {
            debug!("No device for {}", message.topic);
            return None;
        };

        let payload = message.payload_str();
        let value = Value::from_payload(&payload);
        info!("Setting {} to {}", record.name(), payload.trim());

        let address = record.address();
        registry.arm(&address, value.clone());

        Some(SetCommand { address, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PendingCommand;
    use meshbridge_core::DeviceEntry;

    const ALAVALOT: DeviceAddress = DeviceAddress::new(2, 37, 3, 0);

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_entries(&[DeviceEntry::new(
            ALAVALOT,
            "alavalot",
            "nest/zwave/sauna/alavalot",
        )])
        .unwrap()
    }

    #[test]
    fn test_on_off_commands() {
        let mut registry = registry();
        let processor = OutboundProcessor::new();

        for (payload, expected) in [("ON", true), ("OFF", false)] {
            let message = BrokerMessage::new("nest/zwave/sauna/alavalot/set", payload);
            let command = processor.process(&mut registry, &message).unwrap();

            assert_eq!(command.address, ALAVALOT);
            assert_eq!(command.value, Value::Bool(expected));
            assert_eq!(command.value.as_number(), Some(if expected { 1.0 } else { 0.0 }));
            assert_eq!(
                registry.lookup(&ALAVALOT).unwrap().pending(),
                Some(&PendingCommand::new(Value::Bool(expected)))
            );
        }
    }

    #[test]
    fn test_integer_and_text_payloads() {
        let mut registry = registry();
        let processor = OutboundProcessor::new();

        let message = BrokerMessage::new("nest/zwave/sauna/alavalot/set", "55");
        let command = processor.process(&mut registry, &message).unwrap();
        assert_eq!(command.value, Value::Number(55.0));

        let message = BrokerMessage::new("nest/zwave/sauna/alavalot/set", "Eco");
        let command = processor.process(&mut registry, &message).unwrap();
        assert_eq!(command.value, Value::Text("Eco".to_string()));
    }

    #[test]
    fn test_unknown_topics_are_ignored() {
        let mut registry = registry();
        let processor = OutboundProcessor::new();

        for topic in [
            "nest/zwave/sauna/alavalot/state",
            "nest/zwave/sauna/alavalot",
            "nest/zwave/sauna/other/set",
            "nest/zwave/sauna/set",
        ] {
            let message = BrokerMessage::new(topic, "ON");
            assert!(processor.process(&mut registry, &message).is_none());
        }
        assert!(!registry.is_pending(&ALAVALOT));
    }
}
