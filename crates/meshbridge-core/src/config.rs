//! Bridge configuration.
//!
//! The whole configuration is a single TOML file loaded once at startup.
//! Loading validates the device table before anything connects, so a
//! malformed file fails fast.
//!
//! ```toml
//! [broker]
//! host = "172.16.153.4"
//!
//! [[devices]]
//! address = [2, 37, 3, 0]
//! name = "alavalot"
//! topic = "nest/zwave/sauna/alavalot"
//! ```

use crate::error::ConfigError;
use crate::value::DeviceAddress;
use crate::{SET_SUFFIX, STATE_SUFFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default retry ceiling for stale readings.
pub const DEFAULT_RETRY_LIMIT: u32 = 6;
/// Default delay before a refresh is requested after a stale reading.
pub const DEFAULT_REFRESH_DELAY_MS: u64 = 400;
/// Default grace period between disconnect and process exit.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 1000;

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client ID. A random one is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_clean_session")]
    pub clean_session: bool,

    /// Umbrella subscription. Derived from the device topics when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    60
}

fn default_clean_session() -> bool {
    true
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(default_host())
    }
}

impl BrokerConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: default_clean_session(),
            subscription: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set authentication.
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the client ID.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Configured client ID, or a fresh `meshbridge_<uuid>`.
    pub fn client_id_or_default(&self) -> String {
        self.client_id
            .clone()
            .unwrap_or_else(|| format!("meshbridge_{}", uuid::Uuid::new_v4()))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Get the full broker address.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which mesh driver backs the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshDriver {
    /// In-process simulator
    #[default]
    Simulated,
}

/// Mesh controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Controller device path.
    #[serde(default = "default_mesh_device")]
    pub device: String,

    #[serde(default)]
    pub driver: MeshDriver,
}

fn default_mesh_device() -> String {
    "/dev/ttyACM0".to_string()
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            device: default_mesh_device(),
            driver: MeshDriver::default(),
        }
    }
}

/// Tunables for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    /// Stale readings tolerated before the next reading is accepted as is.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    #[serde(default = "default_refresh_delay")]
    pub refresh_delay_ms: u64,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_refresh_delay() -> u64 {
    DEFAULT_REFRESH_DELAY_MS
}

fn default_shutdown_grace() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            retry_limit: DEFAULT_RETRY_LIMIT,
            refresh_delay_ms: DEFAULT_REFRESH_DELAY_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl ReconcileSettings {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// One bridged mesh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub address: DeviceAddress,
    pub name: String,
    /// Topic stem; the device listens on `<topic>/set` and publishes `<topic>/state`.
    pub topic: String,
}

impl DeviceEntry {
    pub fn new(address: DeviceAddress, name: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            topic: topic.into(),
        }
    }

    pub fn set_topic(&self) -> String {
        format!("{}{}", self.topic, SET_SUFFIX)
    }

    pub fn state_topic(&self) -> String {
        format!("{}{}", self.topic, STATE_SUFFIX)
    }

    fn validate_topic(&self) -> Result<(), ConfigError> {
        let reason = if self.topic.is_empty() {
            Some("topic is empty")
        } else if self.topic.contains(['+', '#']) {
            Some("topic contains a wildcard")
        } else if self.topic.starts_with('/') || self.topic.ends_with('/') {
            Some("topic has a leading or trailing '/'")
        } else if self.topic.ends_with(SET_SUFFIX) || self.topic.ends_with(STATE_SUFFIX) {
            Some("topic ends with a reserved suffix")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidTopic {
                name: self.name.clone(),
                topic: self.topic.clone(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub mesh: MeshConfig,

    #[serde(default)]
    pub reconcile: ReconcileSettings,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

impl BridgeConfig {
    /// Read and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML content.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the device table: non-empty, unique addresses and topics,
    /// well-formed topic stems.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }

        let mut addresses: HashMap<DeviceAddress, &str> = HashMap::new();
        let mut topics: HashMap<&str, &str> = HashMap::new();

        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(device.address));
            }
            device.validate_topic()?;

            if let Some(first) = addresses.insert(device.address, &device.name) {
                return Err(ConfigError::DuplicateAddress {
                    address: device.address,
                    first: first.to_string(),
                    second: device.name.clone(),
                });
            }
            if let Some(first) = topics.insert(device.topic.as_str(), &device.name) {
                return Err(ConfigError::DuplicateTopic {
                    topic: device.topic.clone(),
                    first: first.to_string(),
                    second: device.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// The single pattern the bridge subscribes to.
    pub fn subscription(&self) -> String {
        match &self.broker.subscription {
            Some(pattern) => pattern.clone(),
            None => umbrella_subscription(self.devices.iter().map(|d| d.topic.as_str())),
        }
    }
}

/// Longest common topic-level prefix of `topics` followed by `/#`.
///
/// Returns `#` when the topics share no leading level.
pub fn umbrella_subscription<'a>(topics: impl IntoIterator<Item = &'a str>) -> String {
    let mut prefix: Option<Vec<&str>> = None;

    for topic in topics {
        let levels: Vec<&str> = topic.split('/').collect();
        prefix = Some(match prefix {
            None => levels,
            Some(current) => current
                .iter()
                .zip(levels.iter())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| *a)
                .collect(),
        });
    }

    match prefix {
        Some(levels) if !levels.is_empty() => format!("{}/#", levels.join("/")),
        _ => "#".to_string(),
    }
}
