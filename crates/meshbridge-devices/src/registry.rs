//! Device Registry - addressing table and per-device confirmation state
//!
//! The registry is built once from configuration. Addresses and topics never
//! change afterwards; the only mutable part is the [`PendingCommand`] of each
//! record, armed by the outbound side and cleared by the inbound side.
//!
//! Lookups for unknown addresses or topics return `None` and mutations on
//! them are no-ops: traffic for unmonitored values is simply ignored.

use meshbridge_core::{BridgeConfig, ConfigError, DeviceAddress, DeviceEntry, Value};
use meshbridge_core::{SET_SUFFIX, STATE_SUFFIX};
use std::collections::HashMap;

/// An outbound command whose effect has not been observed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    /// Value the command requested
    pub expected: Value,
    /// Stale readings seen since the command was issued
    pub retry_count: u32,
}

impl PendingCommand {
    pub fn new(expected: Value) -> Self {
        Self {
            expected,
            retry_count: 0,
        }
    }
}

/// One bridged mesh value.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    address: DeviceAddress,
    name: String,
    topic: String,
    pending: Option<PendingCommand>,
}

impl DeviceRecord {
    fn from_entry(entry: &DeviceEntry) -> Self {
        Self {
            address: entry.address,
            name: entry.name.clone(),
            topic: entry.topic.clone(),
            pending: None,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topic stem.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&self) -> String {
        format!("{}{}", self.topic, SET_SUFFIX)
    }

    pub fn state_topic(&self) -> String {
        format!("{}{}", self.topic, STATE_SUFFIX)
    }

    pub fn pending(&self) -> Option<&PendingCommand> {
        self.pending.as_ref()
    }
}

/// Keyed table of bridged devices.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    /// Records in configuration order
    records: Vec<DeviceRecord>,
    by_address: HashMap<DeviceAddress, usize>,
    by_topic: HashMap<String, usize>,
}

impl DeviceRegistry {
    /// Build the registry from a validated configuration.
    pub fn from_config(config: &BridgeConfig) -> Result<Self, ConfigError> {
        Self::from_entries(&config.devices)
    }

    /// Build the registry from device entries.
    ///
    /// Duplicate addresses or topics are rejected so that every address maps
    /// to exactly one record.
    pub fn from_entries(entries: &[DeviceEntry]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();

        for entry in entries {
            let slot = registry.records.len();

            if let Some(&first) = registry.by_address.get(&entry.address) {
                return Err(ConfigError::DuplicateAddress {
                    address: entry.address,
                    first: registry.records[first].name.clone(),
                    second: entry.name.clone(),
                });
            }
            if let Some(&first) = registry.by_topic.get(&entry.topic) {
                return Err(ConfigError::DuplicateTopic {
                    topic: entry.topic.clone(),
                    first: registry.records[first].name.clone(),
                    second: entry.name.clone(),
                });
            }

            registry.by_address.insert(entry.address, slot);
            registry.by_topic.insert(entry.topic.clone(), slot);
            registry.records.push(DeviceRecord::from_entry(entry));
        }

        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in configuration order.
    pub fn records(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.records.iter()
    }

    pub fn lookup(&self, address: &DeviceAddress) -> Option<&DeviceRecord> {
        self.by_address.get(address).map(|&slot| &self.records[slot])
    }

    /// Find the record whose topic stem is `topic`.
    pub fn lookup_by_topic(&self, topic: &str) -> Option<&DeviceRecord> {
        self.by_topic.get(topic).map(|&slot| &self.records[slot])
    }

    fn lookup_mut(&mut self, address: &DeviceAddress) -> Option<&mut DeviceRecord> {
        match self.by_address.get(address) {
            Some(&slot) => Some(&mut self.records[slot]),
            None => None,
        }
    }

    /// Start waiting for `expected` on `address`, replacing any outstanding
    /// pending command.
    pub fn arm(&mut self, address: &DeviceAddress, expected: Value) {
        if let Some(record) = self.lookup_mut(address) {
            record.pending = Some(PendingCommand::new(expected));
        }
    }

    /// Drop the pending command of `address`, returning it if there was one.
    pub fn clear_pending(&mut self, address: &DeviceAddress) -> Option<PendingCommand> {
        self.lookup_mut(address).and_then(|record| record.pending.take())
    }

    /// Count a stale reading against the pending command of `address`.
    ///
    /// Returns the new retry count, or `None` when nothing is pending.
    pub fn record_stale_hit(&mut self, address: &DeviceAddress) -> Option<u32> {
        let pending = self.lookup_mut(address)?.pending.as_mut()?;
        pending.retry_count += 1;
        Some(pending.retry_count)
    }

    pub fn is_pending(&self, address: &DeviceAddress) -> bool {
        self.lookup(address)
            .is_some_and(|record| record.pending.is_some())
    }
}
