//! Modbus-TCP protocol adapter

mod adapter;
pub mod address;

pub use adapter::ModbusTcpAdapter;
pub use address::{AddressFormat, AddressResolver, H5uAddress, NumericAddress};
