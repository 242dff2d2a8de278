//! Register marshaling
//!
//! Modbus and S7 disagree on byte order and must not be unified:
//! - Modbus 32-bit values span two registers, low word at the lower address.
//! - S7 values live in a byte buffer and are big-endian.
//!
//! Floats are always a bit reinterpretation of the 32-bit pattern.

use std::collections::HashMap;

use crate::error::{BridgeError, Result};
use crate::s7_address::{ElementKind, S7Address};
use crate::variable::{DataType, Value};

/// Holding register values keyed by absolute address
pub type RegisterMap = HashMap<u16, u16>;

/// Coil states keyed by absolute address
pub type CoilMap = HashMap<u16, bool>;

fn register_at(registers: &RegisterMap, address: u16) -> Result<u16> {
    registers
        .get(&address)
        .copied()
        .ok_or_else(|| BridgeError::out_of_range(format!("register {} was not read", address)))
}

/// Merge a block read into `registers`
pub fn merge_registers(registers: &mut RegisterMap, start: u16, values: &[u16]) {
    for (offset, value) in values.iter().enumerate() {
        if let Some(address) = start.checked_add(offset as u16) {
            registers.insert(address, *value);
        }
    }
}

/// Merge a coil block read into `coils`
pub fn merge_coils(coils: &mut CoilMap, start: u16, values: &[bool]) {
    for (offset, value) in values.iter().enumerate() {
        if let Some(address) = start.checked_add(offset as u16) {
            coils.insert(address, *value);
        }
    }
}

pub fn coils_to_value(coils: &CoilMap, address: u16) -> Result<Value> {
    coils
        .get(&address)
        .map(|b| Value::Bool(*b))
        .ok_or_else(|| BridgeError::out_of_range(format!("coil {} was not read", address)))
}

/// Decode a register-backed value starting at `address`
pub fn registers_to_value(data_type: DataType, registers: &RegisterMap, address: u16) -> Result<Value> {
    match data_type {
        DataType::Bool => Err(BridgeError::unsupported(format!(
            "Bool at {} cannot be decoded from holding registers, use a coil",
            address
        ))),
        DataType::Short => Ok(Value::Short(register_at(registers, address)? as i16)),
        DataType::UShort => Ok(Value::UShort(register_at(registers, address)?)),
        DataType::Int32 | DataType::UInt32 | DataType::Float => {
            let high_address = address.checked_add(1).ok_or_else(|| {
                BridgeError::out_of_range(format!(
                    "32-bit value at {} runs past the address space",
                    address
                ))
            })?;
            let low = register_at(registers, address)?;
            let high = register_at(registers, high_address)?;
            let bits = (u32::from(high) << 16) | u32::from(low);
            Ok(match data_type {
                DataType::Int32 => Value::Int32(bits as i32),
                DataType::UInt32 => Value::UInt32(bits),
                _ => Value::Float(f32::from_bits(bits)),
            })
        },
    }
}

/// Encode a value as Modbus registers (low word first for 32-bit values)
pub fn value_to_registers(value: &Value) -> Vec<u16> {
    let split = |bits: u32| vec![bits as u16, (bits >> 16) as u16];
    match *value {
        Value::Bool(b) => vec![u16::from(b)],
        Value::Short(v) => vec![v as u16],
        Value::UShort(v) => vec![v],
        Value::Int32(v) => split(v as u32),
        Value::UInt32(v) => split(v),
        Value::Float(v) => split(v.to_bits()),
    }
}

/// Whether `data_type` can be stored in an element of `kind`
pub fn check_kind(data_type: DataType, kind: ElementKind) -> Result<()> {
    let compatible = matches!(
        (kind, data_type),
        (ElementKind::Bit, DataType::Bool)
            | (ElementKind::Byte, DataType::Short | DataType::UShort)
            | (ElementKind::Word, DataType::Short | DataType::UShort)
            | (
                ElementKind::DWord,
                DataType::Int32 | DataType::UInt32 | DataType::Float
            )
    );
    if compatible {
        Ok(())
    } else {
        Err(BridgeError::type_mismatch(format!(
            "{} cannot be stored in a {:?} element",
            data_type, kind
        )))
    }
}

/// Decode the element at `address` from `buffer`, whose first byte sits at `base_offset`
pub fn bytes_to_value(
    data_type: DataType,
    address: &S7Address,
    buffer: &[u8],
    base_offset: u32,
) -> Result<Value> {
    check_kind(data_type, address.kind)?;

    let out_of_range = || {
        BridgeError::out_of_range(format!(
            "{} not inside buffer of {} bytes at offset {}",
            address,
            buffer.len(),
            base_offset
        ))
    };

    let start = address
        .byte_offset
        .checked_sub(base_offset)
        .ok_or_else(out_of_range)? as usize;
    let width = address.kind.byte_width() as usize;
    let bytes = buffer.get(start..start + width).ok_or_else(out_of_range)?;

    let value = match address.kind {
        ElementKind::Bit => {
            let bit = address.bit_offset.unwrap_or(0);
            Value::Bool(bytes[0] & (1 << bit) != 0)
        },
        ElementKind::Byte => match data_type {
            DataType::Short => Value::Short(i16::from(bytes[0])),
            _ => Value::UShort(u16::from(bytes[0])),
        },
        ElementKind::Word => {
            let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
            match data_type {
                DataType::Short => Value::Short(raw as i16),
                _ => Value::UShort(raw),
            }
        },
        ElementKind::DWord => {
            let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            match data_type {
                DataType::Int32 => Value::Int32(raw as i32),
                DataType::UInt32 => Value::UInt32(raw),
                _ => Value::Float(f32::from_bits(raw)),
            }
        },
    };
    Ok(value)
}

/// Encode a value for an element of `kind`, big-endian
pub fn value_to_bytes(value: &Value, kind: ElementKind) -> Result<Vec<u8>> {
    check_kind(value.data_type(), kind)?;

    let bytes = match (kind, *value) {
        (ElementKind::Bit, Value::Bool(b)) => vec![u8::from(b)],
        (ElementKind::Byte, Value::Short(v)) => vec![u8::try_from(v).map_err(|_| {
            BridgeError::type_mismatch(format!("{} does not fit in a byte", v))
        })?],
        (ElementKind::Byte, Value::UShort(v)) => vec![u8::try_from(v).map_err(|_| {
            BridgeError::type_mismatch(format!("{} does not fit in a byte", v))
        })?],
        (ElementKind::Word, Value::Short(v)) => v.to_be_bytes().to_vec(),
        (ElementKind::Word, Value::UShort(v)) => v.to_be_bytes().to_vec(),
        (ElementKind::DWord, Value::Int32(v)) => v.to_be_bytes().to_vec(),
        (ElementKind::DWord, Value::UInt32(v)) => v.to_be_bytes().to_vec(),
        (ElementKind::DWord, Value::Float(v)) => v.to_bits().to_be_bytes().to_vec(),
        (kind, value) => {
            return Err(BridgeError::type_mismatch(format!(
                "{} cannot be stored in a {:?} element",
                value.data_type(),
                kind
            )))
        },
    };
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registers(start: u16, values: &[u16]) -> RegisterMap {
        let mut map = RegisterMap::new();
        merge_registers(&mut map, start, values);
        map
    }

    #[test]
    fn test_int32_low_word_first() {
        let words = value_to_registers(&Value::Int32(0x1234_5678));
        assert_eq!(words, vec![0x5678, 0x1234]);

        let map = registers(10, &words);
        assert_eq!(
            registers_to_value(DataType::Int32, &map, 10).unwrap(),
            Value::Int32(0x1234_5678)
        );
    }

    #[test]
    fn test_wrong_word_order_differs() {
        let words = value_to_registers(&Value::Int32(0x1234_5678));
        let swapped = registers(0, &[words[1], words[0]]);
        assert_ne!(
            registers_to_value(DataType::Int32, &swapped, 0).unwrap(),
            Value::Int32(0x1234_5678)
        );
    }

    #[test]
    fn test_float_bit_reinterpretation() {
        for f in [1.5f32, -273.15, f32::MAX, 0.0] {
            let map = registers(0, &value_to_registers(&Value::Float(f)));
            assert_eq!(
                registers_to_value(DataType::Float, &map, 0).unwrap(),
                Value::Float(f)
            );
        }
    }

    #[test]
    fn test_unsigned_round_trip() {
        let map = registers(0, &value_to_registers(&Value::UInt32(0xFFFF_0001)));
        assert_eq!(
            registers_to_value(DataType::UInt32, &map, 0).unwrap(),
            Value::UInt32(0xFFFF_0001)
        );

        let map = registers(5, &value_to_registers(&Value::UShort(65535)));
        assert_eq!(
            registers_to_value(DataType::UShort, &map, 5).unwrap(),
            Value::UShort(65535)
        );
        assert_eq!(
            registers_to_value(DataType::Short, &map, 5).unwrap(),
            Value::Short(-1)
        );
    }

    #[test]
    fn test_missing_register_is_out_of_range() {
        let map = registers(0, &[1]);
        let err = registers_to_value(DataType::Int32, &map, 0).unwrap_err();
        assert!(matches!(err, BridgeError::AddressOutOfRange(_)));
        let err = registers_to_value(DataType::Int32, &map, u16::MAX).unwrap_err();
        assert!(matches!(err, BridgeError::AddressOutOfRange(_)));
    }

    #[test]
    fn test_bool_from_registers_is_unsupported() {
        let map = registers(0, &[1]);
        let err = registers_to_value(DataType::Bool, &map, 0).unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedDataType(_)));
    }

    #[test]
    fn test_s7_big_endian() {
        let address: S7Address = "DB1.DBD4".parse().unwrap();
        let bytes = value_to_bytes(&Value::Int32(0x1234_5678), address.kind).unwrap();
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);

        let mut buffer = vec![0u8; 4];
        buffer.extend_from_slice(&bytes);
        assert_eq!(
            bytes_to_value(DataType::Int32, &address, &buffer, 0).unwrap(),
            Value::Int32(0x1234_5678)
        );
    }

    #[test]
    fn test_s7_bit_and_base_offset() {
        let address: S7Address = "DB1.DBX10.3".parse().unwrap();
        let buffer = [0u8, 0b0000_1000];
        assert_eq!(
            bytes_to_value(DataType::Bool, &address, &buffer, 9).unwrap(),
            Value::Bool(true)
        );
        let err = bytes_to_value(DataType::Bool, &address, &buffer, 11).unwrap_err();
        assert!(matches!(err, BridgeError::AddressOutOfRange(_)));
    }

    #[test]
    fn test_s7_short_buffer() {
        let address: S7Address = "DB1.DBD2".parse().unwrap();
        let err = bytes_to_value(DataType::Float, &address, &[0u8; 5], 0).unwrap_err();
        assert!(matches!(err, BridgeError::AddressOutOfRange(_)));
    }

    #[test]
    fn test_s7_type_mismatch() {
        let bit: S7Address = "DB1.DBX0.0".parse().unwrap();
        let err = bytes_to_value(DataType::Int32, &bit, &[0u8; 4], 0).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch(_)));

        let err = value_to_bytes(&Value::Float(1.0), ElementKind::Word).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch(_)));

        let err = value_to_bytes(&Value::UShort(300), ElementKind::Byte).unwrap_err();
        assert!(matches!(err, BridgeError::TypeMismatch(_)));
    }

    #[test]
    fn test_s7_float_round_trip() {
        let address: S7Address = "DB3.DBD0".parse().unwrap();
        let bytes = value_to_bytes(&Value::Float(12.5), address.kind).unwrap();
        assert_eq!(
            bytes_to_value(DataType::Float, &address, &bytes, 0).unwrap(),
            Value::Float(12.5)
        );
    }
}
