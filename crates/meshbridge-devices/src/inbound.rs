//! Inbound reconciliation: mesh value events to confirmed broker state.
//!
//! Some nodes report their pre-command value right after a command, before
//! the new value has settled. While a command is pending, readings that do
//! not match the commanded value are held back and a refresh is requested
//! instead. After `retry_limit` stale readings the next reading is accepted
//! whatever it says, so a device that never reports the exact value still
//! gets its state published.

use crate::registry::DeviceRegistry;
use meshbridge_core::{DeviceAddress, MeshValue, ReconcileSettings};
use std::time::Duration;
use tracing::{debug, info};

/// A retained state publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// What the dispatch loop must do with a mesh value event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Address is not bridged
    Unmonitored,
    /// Plain state observation, nothing was pending
    Observed(StateUpdate),
    /// Pending command confirmed; `forced` when accepted because the retry
    /// ceiling was reached rather than because the value matched
    Confirmed { update: StateUpdate, forced: bool },
    /// Stale reading suppressed; request a refresh after `delay`
    Stale {
        address: DeviceAddress,
        retry_count: u32,
        delay: Duration,
    },
}

impl InboundOutcome {
    /// State to publish, if any.
    pub fn update(&self) -> Option<&StateUpdate> {
        match self {
            Self::Observed(update) | Self::Confirmed { update, .. } => Some(update),
            _ => None,
        }
    }
}

/// Decides whether a mesh reading is published or treated as stale.
#[derive(Debug, Clone)]
pub struct InboundProcessor {
    retry_limit: u32,
    refresh_delay: Duration,
}

impl Default for InboundProcessor {
    fn default() -> Self {
        Self::new(&ReconcileSettings::default())
    }
}

impl InboundProcessor {
    pub fn new(settings: &ReconcileSettings) -> Self {
        Self {
            retry_limit: settings.retry_limit,
            refresh_delay: settings.refresh_delay(),
        }
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    /// Reconcile one value event for `node_id`/`command_class`.
    pub fn process(
        &self,
        registry: &mut DeviceRegistry,
        node_id: u8,
        command_class: u8,
        value: &MeshValue,
    ) -> InboundOutcome {
        let address = DeviceAddress::new(node_id, command_class, value.instance, value.index);

        let Some(record) = registry.lookup(&address) else {
            return InboundOutcome::Unmonitored;
        };

        let update = StateUpdate {
            topic: record.state_topic(),
            payload: value.value.to_payload(value.value_type),
            retain: true,
        };

        let Some(pending) = record.pending() else {
            info!(
                "Got device state for {}: {} ({})",
                record.name(),
                value.value,
                value.value_type
            );
            return InboundOutcome::Observed(update);
        };

        let matched = value.value.matches(&pending.expected);
        if matched || pending.retry_count >= self.retry_limit {
            if !matched {
                info!(
                    "Accepting {} for {} after {} stale readings (expected {})",
                    value.value,
                    record.name(),
                    pending.retry_count,
                    pending.expected
                );
            } else {
                info!("Confirmed state for {}: {}", record.name(), value.value);
            }
            registry.clear_pending(&address);
            return InboundOutcome::Confirmed {
                update,
                forced: !matched,
            };
        }

        info!(
            "Got old value for {} {}: {} when it should be {}, checked {} times",
            record.name(),
            address,
            value.value,
            pending.expected,
            pending.retry_count
        );
        let retry_count = registry.record_stale_hit(&address).unwrap_or_default();
        debug!(
            "Refreshing {} in {}ms",
            address,
            self.refresh_delay.as_millis()
        );

        InboundOutcome::Stale {
            address,
            retry_count,
            delay: self.refresh_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::{DeviceEntry, Value, ValueType};

    const ALAVALOT: DeviceAddress = DeviceAddress::new(2, 37, 3, 0);

    fn registry() -> DeviceRegistry {
        DeviceRegistry::from_entries(&[
            DeviceEntry::new(ALAVALOT, "alavalot", "nest/zwave/sauna/alavalot"),
            DeviceEntry::new(
                DeviceAddress::new(5, 49, 1, 1),
                "temperature",
                "nest/zwave/sauna/temperature",
            ),
        ])
        .unwrap()
    }

    fn switch(value: bool) -> MeshValue {
        MeshValue::new(3, 0, ValueType::Bool, value)
    }

    #[test]
    fn test_observation_without_pending_publishes() {
        let mut registry = registry();
        let processor = InboundProcessor::default();

        let outcome = processor.process(&mut registry, 2, 37, &switch(true));
        assert_eq!(
            outcome,
            InboundOutcome::Observed(StateUpdate {
                topic: "nest/zwave/sauna/alavalot/state".to_string(),
                payload: "ON".to_string(),
                retain: true,
            })
        );
    }

    #[test]
    fn test_numeric_observation_keeps_literal_form() {
        let mut registry = registry();
        let processor = InboundProcessor::default();

        let reading = MeshValue::new(1, 1, ValueType::Decimal, 21.5);
        let outcome = processor.process(&mut registry, 5, 49, &reading);
        let update = outcome.update().unwrap();
        assert_eq!(update.topic, "nest/zwave/sauna/temperature/state");
        assert_eq!(update.payload, "21.5");
    }

    #[test]
    fn test_unmonitored_value_is_ignored() {
        let mut registry = registry();
        let processor = InboundProcessor::default();

        // Same node and class, different instance.
        let reading = MeshValue::new(2, 0, ValueType::Bool, true);
        assert_eq!(
            processor.process(&mut registry, 2, 37, &reading),
            InboundOutcome::Unmonitored
        );
        assert!(registry.records().all(|r| r.pending().is_none()));
    }

    #[test]
    fn test_stale_reading_is_suppressed() {
        let mut registry = registry();
        let processor = InboundProcessor::default();
        registry.arm(&ALAVALOT, Value::Bool(true));

        let outcome = processor.process(&mut registry, 2, 37, &switch(false));
        assert_eq!(
            outcome,
            InboundOutcome::Stale {
                address: ALAVALOT,
                retry_count: 1,
                delay: Duration::from_millis(400),
            }
        );
        assert!(outcome.update().is_none());
        assert_eq!(
            registry.lookup(&ALAVALOT).unwrap().pending().unwrap().retry_count,
            1
        );
    }

    #[test]
    fn test_matching_reading_confirms() {
        let mut registry = registry();
        let processor = InboundProcessor::default();
        registry.arm(&ALAVALOT, Value::Bool(true));
        processor.process(&mut registry, 2, 37, &switch(false));

        let outcome = processor.process(&mut registry, 2, 37, &switch(true));
        assert!(matches!(
            outcome,
            InboundOutcome::Confirmed { forced: false, .. }
        ));
        assert_eq!(outcome.update().unwrap().payload, "ON");
        assert!(!registry.is_pending(&ALAVALOT));
    }

    #[test]
    fn test_numeric_command_confirmed_by_bool_reading() {
        let mut registry = registry();
        let processor = InboundProcessor::default();
        registry.arm(&ALAVALOT, Value::Number(1.0));

        let outcome = processor.process(&mut registry, 2, 37, &switch(true));
        assert!(matches!(
            outcome,
            InboundOutcome::Confirmed { forced: false, .. }
        ));
    }

    #[test]
    fn test_retry_ceiling_forces_acceptance() {
        let mut registry = registry();
        let processor = InboundProcessor::default();
        registry.arm(&ALAVALOT, Value::Bool(true));

        for expected in 1..=6 {
            let outcome = processor.process(&mut registry, 2, 37, &switch(false));
            assert!(
                matches!(outcome, InboundOutcome::Stale { retry_count, .. } if retry_count == expected)
            );
        }

        let outcome = processor.process(&mut registry, 2, 37, &switch(false));
        assert!(matches!(outcome, InboundOutcome::Confirmed { forced: true, .. }));
        assert_eq!(outcome.update().unwrap().payload, "OFF");
        assert!(!registry.is_pending(&ALAVALOT));
    }

    #[test]
    fn test_custom_retry_limit() {
        let mut registry = registry();
        let processor = InboundProcessor::new(&ReconcileSettings {
            retry_limit: 1,
            ..Default::default()
        });
        registry.arm(&ALAVALOT, Value::Bool(true));

        assert!(matches!(
            processor.process(&mut registry, 2, 37, &switch(false)),
            InboundOutcome::Stale { .. }
        ));
        assert!(matches!(
            processor.process(&mut registry, 2, 37, &switch(false)),
            InboundOutcome::Confirmed { forced: true, .. }
        ));
    }
}
