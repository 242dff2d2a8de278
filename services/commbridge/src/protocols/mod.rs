//! Protocol adapters
//!
//! An adapter owns one transport and turns variable sets into bulk transport
//! calls. The service only ever talks to adapters through `ProtocolAdapter`.

pub mod modbus;
pub mod s7;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{BridgeError, Result};
use crate::events::LogSink;
use crate::variable::{Value, Variable};

pub use modbus::{ModbusTcpAdapter, NumericAddress, H5uAddress, AddressResolver};
pub use s7::S7Adapter;

/// Protocol family of an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    #[serde(alias = "modbus", alias = "modbus-tcp", alias = "ModbusTcp")]
    ModbusTcp,
    #[serde(alias = "S7", alias = "siemens")]
    S7,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolKind::ModbusTcp => f.write_str("Modbus-TCP"),
            ProtocolKind::S7 => f.write_str("S7"),
        }
    }
}

/// Flat connection options, keys matched case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProtocolParams {
    entries: HashMap<String, JsonValue>,
}

impl ProtocolParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    /// String form of a scalar option (numbers are rendered as text)
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        let parsed = match raw {
            JsonValue::Number(n) => n.as_u64(),
            JsonValue::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| BridgeError::config(format!("{} must be a non-negative integer, got {}", key, raw)))
    }

    pub fn get_u16(&self, key: &str) -> Result<Option<u16>> {
        self.get_u64(key)?
            .map(|v| {
                u16::try_from(v)
                    .map_err(|_| BridgeError::config(format!("{} = {} is out of range", key, v)))
            })
            .transpose()
    }

    pub fn get_u8(&self, key: &str) -> Result<Option<u8>> {
        self.get_u64(key)?
            .map(|v| {
                u8::try_from(v)
                    .map_err(|_| BridgeError::config(format!("{} = {} is out of range", key, v)))
            })
            .transpose()
    }

    pub fn require_str(&self, key: &str) -> Result<String> {
        self.get_str(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| BridgeError::config(format!("missing required parameter '{}'", key)))
    }

    pub fn require_u16(&self, key: &str) -> Result<u16> {
        self.get_u16(key)?
            .ok_or_else(|| BridgeError::config(format!("missing required parameter '{}'", key)))
    }
}

impl FromIterator<(String, JsonValue)> for ProtocolParams {
    fn from_iter<I: IntoIterator<Item = (String, JsonValue)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Shared read/write/connect contract of every protocol adapter
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Route this adapter's log events into `sink`
    fn attach_log_sink(&self, sink: LogSink);

    /// Validate `params` and open the transport. Never errors: failures are
    /// logged and reported as `false`.
    async fn connect(&self, params: &ProtocolParams) -> bool;

    async fn is_connected(&self) -> bool;

    /// Refresh the value of every variable in one bulk pass.
    ///
    /// A disconnect costs one reconnect attempt and returns `Ok`; other
    /// failures are returned to the caller.
    async fn read_variables(&self, variables: &[Arc<Variable>]) -> Result<()>;

    /// Write the setpoint of a single variable
    async fn write_variable(&self, variable: &Variable) -> Result<()>;

    /// Write setpoints, coalescing consecutive addresses
    async fn write_variables(&self, variables: &[Arc<Variable>]) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;
}

/// Setpoint of `variable` converted to its declared type, `None` when unset
pub(crate) fn pending_value(variable: &Variable) -> Result<Option<Value>> {
    variable
        .setpoint()
        .map(|v| v.coerce_to(variable.data_type()))
        .transpose()
}
