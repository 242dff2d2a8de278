//! Transport layer
//!
//! Thin async boundaries over the wire protocols. Adapters own exactly one
//! transport per configured protocol and are the only ones that connect,
//! reconnect or disconnect it.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod modbus_tcp;
pub mod s7;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BridgeError, Result};

pub use modbus_tcp::TokioModbusTransport;
pub use s7::S7Client;

/// Per-call quantity limits of the Modbus function codes
pub mod limits {
    /// FC01 read coils
    pub const MAX_READ_COILS: u16 = 2000;
    /// FC15 write multiple coils
    pub const MAX_WRITE_COILS: u16 = 1968;
    /// FC03 read holding registers
    pub const MAX_READ_REGISTERS: u16 = 125;
    /// FC16 write multiple registers
    pub const MAX_WRITE_REGISTERS: u16 = 123;
}

/// Default timeout for connect and each request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Where a Modbus-TCP transport connects to
#[derive(Debug, Clone, PartialEq)]
pub struct ModbusEndpoint {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout: Duration,
}

impl fmt::Display for ModbusEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (unit {})", self.host, self.port, self.unit_id)
    }
}

/// Modbus transport capability (coils and holding registers)
///
/// Only `Send`: the `tokio-modbus` client context is not `Sync`, and adapters
/// hold their transport behind a mutex.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn connect(&mut self, endpoint: &ModbusEndpoint) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>>;

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>>;

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()>;

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()>;

    async fn write_multiple_coils(&mut self, start: u16, values: &[bool]) -> Result<()>;

    async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> Result<()>;
}

/// Siemens CPU family, selects the TSAP pair used at connect time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuType {
    S7200,
    Logo0BA8,
    S7200Smart,
    S7300,
    S7400,
    S71200,
    S71500,
}

/// PG connection type
const CONNECTION_TYPE_PG: u16 = 0x0001;

impl CpuType {
    /// `(local, remote)` TSAP for this CPU at `rack`/`slot`
    pub fn tsaps(self, rack: u16, slot: u16) -> (u16, u16) {
        match self {
            CpuType::S7200 => (0x1000, 0x1001),
            CpuType::Logo0BA8 => (0x0100, 0x0200),
            _ => (0x0100, (CONNECTION_TYPE_PG << 8) + rack * 0x20 + slot),
        }
    }
}

impl FromStr for CpuType {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match normalized.as_str() {
            "S7200" => Ok(CpuType::S7200),
            "LOGO0BA8" | "LOGO" => Ok(CpuType::Logo0BA8),
            "S7200SMART" | "SMART200" => Ok(CpuType::S7200Smart),
            "S7300" => Ok(CpuType::S7300),
            "S7400" => Ok(CpuType::S7400),
            "S71200" => Ok(CpuType::S71200),
            "S71500" => Ok(CpuType::S71500),
            _ => Err(BridgeError::config(format!("unknown CPU type '{}'", s))),
        }
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CpuType::S7200 => "S7200",
            CpuType::Logo0BA8 => "Logo0BA8",
            CpuType::S7200Smart => "S7200Smart",
            CpuType::S7300 => "S7300",
            CpuType::S7400 => "S7400",
            CpuType::S71200 => "S71200",
            CpuType::S71500 => "S71500",
        };
        f.write_str(s)
    }
}

/// Where an S7 transport connects to
#[derive(Debug, Clone, PartialEq)]
pub struct S7Endpoint {
    pub host: String,
    pub port: u16,
    pub rack: u16,
    pub slot: u16,
    pub cpu_type: CpuType,
    pub timeout: Duration,
}

impl fmt::Display for S7Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} ({} rack {} slot {})",
            self.host, self.port, self.cpu_type, self.rack, self.slot
        )
    }
}

/// S7 transport capability (data block byte ranges and single bits)
#[async_trait]
pub trait S7Transport: Send {
    async fn connect(&mut self, endpoint: &S7Endpoint) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    async fn read_db_bytes(&mut self, db: u16, start: u32, len: u32) -> Result<Vec<u8>>;

    async fn write_db_bytes(&mut self, db: u16, start: u32, bytes: &[u8]) -> Result<()>;

    async fn write_db_bit(&mut self, db: u16, byte: u32, bit: u8, value: bool) -> Result<()>;
}
