//! S7 data block address grammar
//!
//! `DB<n>.DBX<byte>.<bit>`, `DB<n>.DBB<byte>`, `DB<n>.DBW<byte>`, `DB<n>.DBD<byte>`
//! (case-insensitive).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{BridgeError, Result};

static S7_ADDRESS_PATTERN: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| {
        Regex::new(r"(?i)^DB(?<db>\d+)\.DB(?<kind>[XBWD])(?<byte>\d+)(?:\.(?<bit>\d+))?$")
    });

/// Element width inside a data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Bit,
    Byte,
    Word,
    DWord,
}

impl ElementKind {
    /// Bytes touched by one element (a bit still occupies its byte)
    pub fn byte_width(self) -> u32 {
        match self {
            ElementKind::Bit | ElementKind::Byte => 1,
            ElementKind::Word => 2,
            ElementKind::DWord => 4,
        }
    }

    fn letter(self) -> char {
        match self {
            ElementKind::Bit => 'X',
            ElementKind::Byte => 'B',
            ElementKind::Word => 'W',
            ElementKind::DWord => 'D',
        }
    }
}

/// Parsed S7 data block address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub db_number: u16,
    pub kind: ElementKind,
    pub byte_offset: u32,
    /// Present iff `kind == Bit`
    pub bit_offset: Option<u8>,
}

/// Largest byte offset representable in the 24-bit S7 bit address
pub const MAX_BYTE_OFFSET: u32 = 0x00FF_FFFF >> 3;

impl S7Address {
    pub fn parse(address: &str) -> Result<Self> {
        let pattern = S7_ADDRESS_PATTERN
            .as_ref()
            .map_err(|e| BridgeError::config(format!("S7 address pattern: {}", e)))?;

        let invalid = |reason: &str| {
            BridgeError::invalid_address(format!("'{}': {}", address, reason))
        };

        let caps = pattern
            .captures(address.trim())
            .ok_or_else(|| invalid("expected DB<n>.DB<X|B|W|D><byte>[.<bit>]"))?;

        let db_number = caps["db"]
            .parse::<u16>()
            .map_err(|_| invalid("data block number out of range"))?;
        let byte_offset = caps["byte"]
            .parse::<u32>()
            .map_err(|_| invalid("byte offset out of range"))?;

        let kind = match caps["kind"].to_ascii_uppercase().as_str() {
            "X" => ElementKind::Bit,
            "B" => ElementKind::Byte,
            "W" => ElementKind::Word,
            _ => ElementKind::DWord,
        };

        if byte_offset
            .checked_add(kind.byte_width())
            .map_or(true, |end| end > MAX_BYTE_OFFSET + 1)
        {
            return Err(BridgeError::out_of_range(format!(
                "'{}': byte offset past the S7 address space (max {})",
                address, MAX_BYTE_OFFSET
            )));
        }

        let bit_offset = match (kind, caps.name("bit")) {
            (ElementKind::Bit, Some(bit)) => {
                let bit = bit
                    .as_str()
                    .parse::<u8>()
                    .ok()
                    .filter(|b| *b <= 7)
                    .ok_or_else(|| invalid("bit offset must be within 0..=7"))?;
                Some(bit)
            },
            (ElementKind::Bit, None) => return Err(invalid("bit address requires .<bit>")),
            (_, Some(_)) => return Err(invalid("only DBX addresses take a bit offset")),
            (_, None) => None,
        };

        Ok(Self {
            db_number,
            kind,
            byte_offset,
            bit_offset,
        })
    }

    /// One past the last byte this element occupies
    pub fn end_offset(&self) -> u32 {
        self.byte_offset.saturating_add(self.kind.byte_width())
    }
}

impl FromStr for S7Address {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DB{}.DB{}{}",
            self.db_number,
            self.kind.letter(),
            self.byte_offset
        )?;
        if let Some(bit) = self.bit_offset {
            write!(f, ".{}", bit)?;
        }
        Ok(())
    }
}

/// Byte span `[start, end)` of one data block that covers a set of elements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbSpan {
    pub start: u32,
    pub end: u32,
}

impl DbSpan {
    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    fn include(&mut self, address: &S7Address) {
        self.start = self.start.min(address.byte_offset);
        self.end = self.end.max(address.end_offset());
    }
}

/// Covering span per data block, keyed by DB number
pub fn db_spans<'a>(addresses: impl IntoIterator<Item = &'a S7Address>) -> BTreeMap<u16, DbSpan> {
    let mut spans: BTreeMap<u16, DbSpan> = BTreeMap::new();
    for address in addresses {
        spans
            .entry(address.db_number)
            .and_modify(|span| span.include(address))
            .or_insert(DbSpan {
                start: address.byte_offset,
                end: address.end_offset(),
            });
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bit() {
        let a = S7Address::parse("DB1.DBX0.3").unwrap();
        assert_eq!(
            a,
            S7Address {
                db_number: 1,
                kind: ElementKind::Bit,
                byte_offset: 0,
                bit_offset: Some(3),
            }
        );
    }

    #[test]
    fn test_parse_dword_case_insensitive() {
        let a: S7Address = "db5.dbd12".parse().unwrap();
        assert_eq!(a.db_number, 5);
        assert_eq!(a.kind, ElementKind::DWord);
        assert_eq!(a.byte_offset, 12);
        assert_eq!(a.bit_offset, None);
        assert_eq!(a.end_offset(), 16);
        assert_eq!(a.to_string(), "DB5.DBD12");
    }

    #[test]
    fn test_bit_out_of_range() {
        let err = S7Address::parse("DB1.DBX0.9").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidAddressFormat(_)));
        assert!(err.to_string().contains("DB1.DBX0.9"));
        assert!(err.to_string().contains("0..=7"));
    }

    #[test]
    fn test_byte_offset_past_address_space() {
        for bad in ["DB1.DBD4294967295", "DB1.DBB2097152", "DB1.DBW2097151"] {
            let err = S7Address::parse(bad).unwrap_err();
            assert!(
                matches!(err, BridgeError::AddressOutOfRange(_)),
                "{} should be out of range",
                bad
            );
        }
        let last = S7Address::parse("DB1.DBB2097151").unwrap();
        assert_eq!(last.end_offset(), MAX_BYTE_OFFSET + 1);
    }

    #[test]
    fn test_invalid_shapes() {
        for bad in ["DBX0.1", "DB1.DBX0", "DB1.DBW4.1", "DB1.DBQ4", "M0.0", "", "DB1.DBD"] {
            let err = S7Address::parse(bad).unwrap_err();
            assert!(
                matches!(err, BridgeError::InvalidAddressFormat(_)),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_db_spans() {
        let addresses: Vec<S7Address> = ["DB1.DBW4", "DB1.DBD10", "DB2.DBX3.1", "DB1.DBB2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        let spans = db_spans(&addresses);
        assert_eq!(spans[&1], DbSpan { start: 2, end: 14 });
        assert_eq!(spans[&2], DbSpan { start: 3, end: 4 });
        assert_eq!(spans[&1].len(), 12);
    }
}
