//! Variable model
//!
//! A `Variable` is a named, typed point bound to a protocol address. Its
//! current value lives in a `watch` channel so consumers can subscribe to
//! changes; updates only notify when the value actually differs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{BridgeError, Result};

/// Logical data type of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Bool,
    #[serde(alias = "int16", alias = "i16")]
    Short,
    #[serde(alias = "uint16", alias = "u16", alias = "ushort")]
    UShort,
    #[serde(alias = "i32", alias = "int")]
    Int32,
    #[serde(alias = "uint32", alias = "u32", alias = "uint")]
    UInt32,
    #[serde(alias = "float32", alias = "f32", alias = "real")]
    Float,
}

impl DataType {
    /// Number of 16-bit Modbus registers one value occupies (coils count as 1)
    pub fn register_width(self) -> u16 {
        match self {
            DataType::Bool | DataType::Short | DataType::UShort => 1,
            DataType::Int32 | DataType::UInt32 | DataType::Float => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Bool => "Bool",
            DataType::Short => "Short",
            DataType::UShort => "UShort",
            DataType::Int32 => "Int32",
            DataType::UInt32 => "UInt32",
            DataType::Float => "Float",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value carried by a variable
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Bool(bool),
    Short(i16),
    UShort(u16),
    Int32(i32),
    UInt32(u32),
    Float(f32),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Short(a), Value::Short(b)) => a == b,
            (Value::UShort(a), Value::UShort(b)) => a == b,
            (Value::Int32(a), Value::Int32(b)) => a == b,
            (Value::UInt32(a), Value::UInt32(b)) => a == b,
            // NaN compares equal to NaN so a stuck NaN reading does not spam change events
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => false,
        }
    }
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Bool(_) => DataType::Bool,
            Value::Short(_) => DataType::Short,
            Value::UShort(_) => DataType::UShort,
            Value::Int32(_) => DataType::Int32,
            Value::UInt32(_) => DataType::UInt32,
            Value::Float(_) => DataType::Float,
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::Bool(b) => Some(i64::from(b)),
            Value::Short(v) => Some(i64::from(v)),
            Value::UShort(v) => Some(i64::from(v)),
            Value::Int32(v) => Some(i64::from(v)),
            Value::UInt32(v) => Some(i64::from(v)),
            Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Some(f as i64),
            Value::Float(_) => None,
        }
    }

    /// Convert to `target`, failing with `TypeMismatch` when the value does not fit
    pub fn coerce_to(&self, target: DataType) -> Result<Value> {
        if self.data_type() == target {
            return Ok(*self);
        }

        let mismatch =
            || BridgeError::type_mismatch(format!("cannot convert {} to {}", self, target));

        match target {
            DataType::Float => match *self {
                Value::Bool(_) => Err(mismatch()),
                Value::Short(v) => Ok(Value::Float(f32::from(v))),
                Value::UShort(v) => Ok(Value::Float(f32::from(v))),
                Value::Int32(v) => Ok(Value::Float(v as f32)),
                Value::UInt32(v) => Ok(Value::Float(v as f32)),
                Value::Float(v) => Ok(Value::Float(v)),
            },
            DataType::Bool => match self.as_i64() {
                Some(0) => Ok(Value::Bool(false)),
                Some(1) => Ok(Value::Bool(true)),
                _ => Err(mismatch()),
            },
            DataType::Short => self
                .as_i64()
                .and_then(|v| i16::try_from(v).ok())
                .map(Value::Short)
                .ok_or_else(mismatch),
            DataType::UShort => self
                .as_i64()
                .and_then(|v| u16::try_from(v).ok())
                .map(Value::UShort)
                .ok_or_else(mismatch),
            DataType::Int32 => self
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int32)
                .ok_or_else(mismatch),
            DataType::UInt32 => self
                .as_i64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Value::UInt32)
                .ok_or_else(mismatch),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Short(v) => write!(f, "{}", v),
            Value::UShort(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::UInt32(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Process-unique variable identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariableId(pub u64);

impl fmt::Display for VariableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic id allocator, owned by whoever creates variables
#[derive(Debug)]
pub struct VariableIds {
    next: AtomicU64,
}

impl VariableIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> VariableId {
        VariableId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for VariableIds {
    fn default() -> Self {
        Self::new()
    }
}

/// A typed data point bound to a protocol address
pub struct Variable {
    id: VariableId,
    name: String,
    address: String,
    data_type: DataType,
    protocol_name: String,
    value: watch::Sender<Option<Value>>,
    setpoint: RwLock<Option<Value>>,
}

impl Variable {
    pub fn new(
        ids: &VariableIds,
        name: impl Into<String>,
        address: impl Into<String>,
        data_type: DataType,
        protocol_name: impl Into<String>,
    ) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            id: ids.next_id(),
            name: name.into(),
            address: address.into(),
            data_type,
            protocol_name: protocol_name.into(),
            value,
            setpoint: RwLock::new(None),
        }
    }

    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    /// Last value read from the controller
    pub fn value(&self) -> Option<Value> {
        *self.value.borrow()
    }

    /// Store a new reading. Returns `true` when subscribers were notified.
    ///
    /// `None -> None` and equal values are silent; any transition to or
    /// from `None` notifies.
    pub fn update_value(&self, new: Option<Value>) -> bool {
        self.value.send_if_modified(|current| {
            if *current == new {
                false
            } else {
                *current = new;
                true
            }
        })
    }

    /// Pending write value
    pub fn setpoint(&self) -> Option<Value> {
        *self.setpoint.read()
    }

    pub fn set_setpoint(&self, value: Option<Value>) {
        *self.setpoint.write() = value;
    }

    /// Subscribe to value changes
    pub fn subscribe(&self) -> watch::Receiver<Option<Value>> {
        self.value.subscribe()
    }
}

fn fmt_opt(value: &Option<Value>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "protocol:{}-name:{}-id:{}-address:{}-type:{}-setpoint:{}-value:{}",
            self.protocol_name,
            self.name,
            self.id,
            self.address,
            self.data_type,
            fmt_opt(&self.setpoint()),
            fmt_opt(&self.value()),
        )
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("data_type", &self.data_type)
            .field("protocol_name", &self.protocol_name)
            .field("value", &self.value())
            .field("setpoint", &self.setpoint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(ids: &VariableIds) -> Variable {
        Variable::new(ids, "temp", "10", DataType::Short, "plc1")
    }

    #[test]
    fn test_ids_are_monotonic() {
        let ids = VariableIds::new();
        let a = var(&ids);
        let b = var(&ids);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_change_notification_rules() {
        let ids = VariableIds::new();
        let v = var(&ids);

        // null -> null is silent
        assert!(!v.update_value(None));
        // null -> 5 fires
        assert!(v.update_value(Some(Value::Short(5))));
        // 5 -> 5 is silent
        assert!(!v.update_value(Some(Value::Short(5))));
        // 5 -> null fires
        assert!(v.update_value(None));
        assert_eq!(v.value(), None);
    }

    #[tokio::test]
    async fn test_subscriber_sees_changes() {
        let ids = VariableIds::new();
        let v = var(&ids);
        let mut rx = v.subscribe();

        v.update_value(Some(Value::Short(7)));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), Some(Value::Short(7)));

        v.update_value(Some(Value::Short(7)));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_nan_equals_nan() {
        assert_eq!(Value::Float(f32::NAN), Value::Float(f32::NAN));
        assert_ne!(Value::Float(1.0), Value::Int32(1));
    }

    #[test]
    fn test_coerce_checked() {
        assert_eq!(
            Value::Int32(70000).coerce_to(DataType::UInt32).unwrap(),
            Value::UInt32(70000)
        );
        assert!(Value::Int32(70000).coerce_to(DataType::Short).is_err());
        assert!(Value::Short(-1).coerce_to(DataType::UShort).is_err());
        assert!(Value::Float(1.5).coerce_to(DataType::Int32).is_err());
        assert_eq!(
            Value::Float(3.0).coerce_to(DataType::Short).unwrap(),
            Value::Short(3)
        );
        assert_eq!(
            Value::UShort(1).coerce_to(DataType::Bool).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_setpoint_is_not_cleared() {
        let ids = VariableIds::new();
        let v = var(&ids);
        v.set_setpoint(Some(Value::Short(3)));
        assert_eq!(v.setpoint(), Some(Value::Short(3)));
        assert_eq!(v.setpoint(), Some(Value::Short(3)));
    }

    #[test]
    fn test_data_type_serde_aliases() {
        let t: DataType = serde_json::from_str("\"int32\"").unwrap();
        assert_eq!(t, DataType::Int32);
        let t: DataType = serde_json::from_str("\"u_short\"").unwrap();
        assert_eq!(t, DataType::UShort);
    }
}
