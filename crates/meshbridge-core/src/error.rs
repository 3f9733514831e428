//! Error types for configuration loading and transport operations.

use crate::value::DeviceAddress;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has missing/mistyped fields
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("No devices configured")]
    NoDevices,

    #[error("Duplicate device address {address} ({first} and {second})")]
    DuplicateAddress {
        address: DeviceAddress,
        first: String,
        second: String,
    },

    #[error("Duplicate device topic '{topic}' ({first} and {second})")]
    DuplicateTopic {
        topic: String,
        first: String,
        second: String,
    },

    #[error("Invalid topic '{topic}' for device {name}: {reason}")]
    InvalidTopic {
        name: String,
        topic: String,
        reason: &'static str,
    },

    #[error("Device at {0} has an empty name")]
    EmptyName(DeviceAddress),
}

/// Error type for mesh and broker transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Communication error
    #[error("Communication error: {0}")]
    Communication(String),

    /// Operation attempted before connect or after disconnect
    #[error("Transport is not connected")]
    NotConnected,

    /// Other error
    #[error("Transport error: {0}")]
    Other(#[from] anyhow::Error),
}
