//! Value model shared by both sides of the bridge.
//!
//! A mesh value is addressed by a [`DeviceAddress`] and carries a scalar
//! [`Value`]. The broker side only ever sees plain-text payloads, so this
//! module also owns the conversion rules in both directions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one scalar value on the mesh network.
///
/// Written in configuration as `[node_id, command_class, instance, index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "RawAddress", into = "RawAddress")]
pub struct DeviceAddress {
    pub node_id: u8,
    pub command_class: u8,
    pub instance: u8,
    pub index: u16,
}

#[derive(Serialize, Deserialize)]
struct RawAddress(u8, u8, u8, u16);

impl From<RawAddress> for DeviceAddress {
    fn from(raw: RawAddress) -> Self {
        Self::new(raw.0, raw.1, raw.2, raw.3)
    }
}

impl From<DeviceAddress> for RawAddress {
    fn from(address: DeviceAddress) -> Self {
        RawAddress(
            address.node_id,
            address.command_class,
            address.instance,
            address.index,
        )
    }
}

impl DeviceAddress {
    pub const fn new(node_id: u8, command_class: u8, instance: u8, index: u16) -> Self {
        Self {
            node_id,
            command_class,
            instance,
            index,
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {}, {}, {}]",
            self.node_id, self.command_class, self.instance, self.index
        )
    }
}

/// Type label reported by the mesh driver alongside a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    Bool,
    Byte,
    Decimal,
    Int,
    List,
    Short,
    String,
    Button,
    Raw,
    #[default]
    Other,
}

impl ValueType {
    /// Parse a driver type label such as `"bool"` or `"decimal"`.
    pub fn from_label(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "bool" => Self::Bool,
            "byte" => Self::Byte,
            "decimal" => Self::Decimal,
            "int" => Self::Int,
            "list" => Self::List,
            "short" => Self::Short,
            "string" => Self::String,
            "button" => Self::Button,
            "raw" => Self::Raw,
            _ => Self::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Byte => "byte",
            Self::Decimal => "decimal",
            Self::Int => "int",
            Self::List => "list",
            Self::Short => "short",
            Self::String => "string",
            Self::Button => "button",
            Self::Raw => "raw",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar mesh value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    /// Translate a broker `set` payload into the value to command.
    ///
    /// Exactly `"ON"`/`"OFF"` become booleans, integer literals become
    /// numbers and anything else is passed through as text.
    pub fn from_payload(payload: &str) -> Self {
        match payload {
            "ON" => Value::Bool(true),
            "OFF" => Value::Bool(false),
            _ => match payload.trim().parse::<i64>() {
                Ok(n) => Value::Number(n as f64),
                Err(_) => Value::Text(payload.to_string()),
            },
        }
    }

    /// Render the value as a broker `state` payload.
    pub fn to_payload(&self, value_type: ValueType) -> String {
        match (self, value_type) {
            (Value::Bool(b), _) => on_off(*b).to_string(),
            (Value::Number(n), ValueType::Bool) => on_off(*n != 0.0).to_string(),
            (Value::Number(n), _) => format_number(*n),
            (Value::Text(s), _) => s.clone(),
        }
    }

    /// Numeric view of the value; booleans count as `1`/`0`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Whether an observed value satisfies an expected one.
    ///
    /// Both sides are compared numerically when they both have a numeric
    /// view, otherwise by their textual form.
    pub fn matches(&self, expected: &Value) -> bool {
        match (self.as_number(), expected.as_number()) {
            (Some(a), Some(b)) => a == b,
            _ => self.to_string() == expected.to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

fn on_off(b: bool) -> &'static str {
    if b { "ON" } else { "OFF" }
}

fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
