//! Modbus address resolution
//!
//! Variables carry address strings; a resolver turns them into the absolute
//! coil/register number used on the wire.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Maps a variable address string to a 16-bit Modbus address
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, address: &str) -> Result<u16>;

    fn name(&self) -> &'static str;
}

/// Plain decimal address, e.g. `"100"`
#[derive(Debug, Clone, Copy, Default)]
pub struct NumericAddress;

impl AddressResolver for NumericAddress {
    fn resolve(&self, address: &str) -> Result<u16> {
        address
            .trim()
            .parse::<u16>()
            .map_err(|_| BridgeError::invalid_address(format!("'{}' is not a Modbus address (0-65535)", address)))
    }

    fn name(&self) -> &'static str {
        "numeric"
    }
}

/// Inovance H5U soft elements (`D100`, `M20`, `X17`...)
///
/// | Element | Modbus base | Offset radix |
/// |---------|-------------|--------------|
/// | M, D    | 0x0000      | decimal      |
/// | B, R    | 0x3000      | decimal      |
/// | S       | 0xE000      | decimal      |
/// | X       | 0xF800      | octal        |
/// | Y       | 0xFC00      | octal        |
#[derive(Debug, Clone, Copy, Default)]
pub struct H5uAddress;

impl H5uAddress {
    fn base(element: &str) -> Option<(u16, u32)> {
        match element {
            "M" | "D" => Some((0x0000, 10)),
            "B" | "R" => Some((0x3000, 10)),
            "S" => Some((0xE000, 10)),
            "X" => Some((0xF800, 8)),
            "Y" => Some((0xFC00, 8)),
            _ => None,
        }
    }
}

impl AddressResolver for H5uAddress {
    fn resolve(&self, address: &str) -> Result<u16> {
        let trimmed = address.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (element, offset) = trimmed.split_at(split);
        let element = element.to_ascii_uppercase();

        let (base, radix) = Self::base(&element).ok_or_else(|| {
            BridgeError::invalid_address(format!("'{}': unknown H5U element '{}'", address, element))
        })?;
        let offset = u16::from_str_radix(offset, radix).map_err(|_| {
            BridgeError::invalid_address(format!(
                "'{}': bad {} offset '{}'",
                address,
                if radix == 8 { "octal" } else { "decimal" },
                offset
            ))
        })?;

        base.checked_add(offset).ok_or_else(|| {
            BridgeError::out_of_range(format!("'{}' maps past Modbus address 65535", address))
        })
    }

    fn name(&self) -> &'static str {
        "h5u"
    }
}

/// Which resolver a Modbus protocol uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFormat {
    #[default]
    Numeric,
    H5u,
}

impl AddressFormat {
    pub fn resolver(self) -> Arc<dyn AddressResolver> {
        match self {
            AddressFormat::Numeric => Arc::new(NumericAddress),
            AddressFormat::H5u => Arc::new(H5uAddress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric() {
        assert_eq!(NumericAddress.resolve("100").unwrap(), 100);
        assert_eq!(NumericAddress.resolve(" 65535 ").unwrap(), 65535);
        assert!(matches!(
            NumericAddress.resolve("65536"),
            Err(BridgeError::InvalidAddressFormat(_))
        ));
        assert!(NumericAddress.resolve("D100").is_err());
    }

    #[test]
    fn test_h5u_decimal_elements() {
        assert_eq!(H5uAddress.resolve("D100").unwrap(), 100);
        assert_eq!(H5uAddress.resolve("M0").unwrap(), 0);
        assert_eq!(H5uAddress.resolve("R10").unwrap(), 0x3000 + 10);
        assert_eq!(H5uAddress.resolve("b1").unwrap(), 0x3001);
        assert_eq!(H5uAddress.resolve("S5").unwrap(), 0xE005);
    }

    #[test]
    fn test_h5u_octal_io() {
        assert_eq!(H5uAddress.resolve("X17").unwrap(), 0xF800 + 15);
        assert_eq!(H5uAddress.resolve("Y10").unwrap(), 0xFC00 + 8);
        assert!(H5uAddress.resolve("X8").is_err());
    }

    #[test]
    fn test_h5u_rejects() {
        assert!(matches!(
            H5uAddress.resolve("Q1"),
            Err(BridgeError::InvalidAddressFormat(_))
        ));
        assert!(H5uAddress.resolve("D").is_err());
        assert!(matches!(
            H5uAddress.resolve("Y2000"),
            Err(BridgeError::AddressOutOfRange(_))
        ));
    }
}
