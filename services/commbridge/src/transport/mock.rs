//! In-memory transports for tests
//!
//! Compiled only for this crate's tests or with the `test-utils` feature.
//!
//! Each mock keeps its device image and call log behind an `Arc`, so a test
//! can keep a clone of the transport as an inspection handle after boxing the
//! original into an adapter.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::limits::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use super::{ModbusEndpoint, ModbusTransport, S7Endpoint, S7Transport};
use crate::error::{BridgeError, Result};

/// Recorded Modbus transport call
#[derive(Debug, Clone, PartialEq)]
pub enum ModbusCall {
    Connect,
    Disconnect,
    ReadCoils { start: u16, count: u16 },
    ReadRegisters { start: u16, count: u16 },
    WriteCoil { address: u16, value: bool },
    WriteRegister { address: u16, value: u16 },
    WriteCoils { start: u16, values: Vec<bool> },
    WriteRegisters { start: u16, values: Vec<u16> },
}

impl ModbusCall {
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            ModbusCall::ReadCoils { .. } | ModbusCall::ReadRegisters { .. }
        )
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ModbusCall::WriteCoil { .. }
                | ModbusCall::WriteRegister { .. }
                | ModbusCall::WriteCoils { .. }
                | ModbusCall::WriteRegisters { .. }
        )
    }
}

#[derive(Debug, Default)]
struct ModbusState {
    coils: HashMap<u16, bool>,
    registers: HashMap<u16, u16>,
    connected: bool,
    refuse_connect: bool,
    fail_next: Option<BridgeError>,
    fail_always: Option<BridgeError>,
    latency: Option<Duration>,
    endpoint: Option<ModbusEndpoint>,
    calls: Vec<ModbusCall>,
}

impl ModbusState {
    /// Log the call and apply injected failures
    fn begin(&mut self, call: ModbusCall) -> Result<()> {
        self.calls.push(call);
        if !self.connected {
            return Err(BridgeError::disconnected("mock Modbus device not connected"));
        }
        let failure = self.fail_next.take().or_else(|| self.fail_always.clone());
        if let Some(err) = failure {
            if err.is_disconnect() {
                self.connected = false;
            }
            return Err(err);
        }
        Ok(())
    }
}

fn check_quantity(what: &str, count: usize, max: u16) -> Result<()> {
    if count == 0 || count > usize::from(max) {
        return Err(BridgeError::protocol(format!(
            "illegal data value: {} quantity {} (max {})",
            what, count, max
        )));
    }
    Ok(())
}

/// Simulated Modbus device. Unwritten coils read false and registers read 0.
#[derive(Clone, Default)]
pub struct MockModbusTransport {
    state: Arc<Mutex<ModbusState>>,
}

impl MockModbusTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_coil(&self, address: u16, value: bool) {
        self.state.lock().coils.insert(address, value);
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn set_registers(&self, start: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (i, v) in values.iter().enumerate() {
            state.registers.insert(start + i as u16, *v);
        }
    }

    pub fn coil(&self, address: u16) -> bool {
        self.state.lock().coils.get(&address).copied().unwrap_or(false)
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state.lock().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn calls(&self) -> Vec<ModbusCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn connect_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == ModbusCall::Connect)
            .count()
    }

    pub fn last_endpoint(&self) -> Option<ModbusEndpoint> {
        self.state.lock().endpoint.clone()
    }

    /// Make subsequent connect attempts fail
    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    /// Fail the next operation with `err`
    pub fn fail_next(&self, err: BridgeError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Fail every operation with `err` until cleared with `None`
    pub fn fail_always(&self, err: Option<BridgeError>) {
        self.state.lock().fail_always = err;
    }

    /// Simulate the peer closing the socket
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }

    /// Delay every read and write by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    async fn wait(&self) {
        let latency = self.state.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ModbusTransport for MockModbusTransport {
    async fn connect(&mut self, endpoint: &ModbusEndpoint) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ModbusCall::Connect);
        state.endpoint = Some(endpoint.clone());
        if state.refuse_connect {
            state.connected = false;
            return Err(BridgeError::transport(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(ModbusCall::Disconnect);
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::ReadCoils { start, count })?;
        check_quantity("coil read", usize::from(count), MAX_READ_COILS)?;
        Ok((0..count)
            .map(|i| {
                let address = start.wrapping_add(i);
                state.coils.get(&address).copied().unwrap_or(false)
            })
            .collect())
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::ReadRegisters { start, count })?;
        check_quantity("register read", usize::from(count), MAX_READ_REGISTERS)?;
        Ok((0..count)
            .map(|i| {
                let address = start.wrapping_add(i);
                state.registers.get(&address).copied().unwrap_or(0)
            })
            .collect())
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::WriteCoil { address, value })?;
        state.coils.insert(address, value);
        Ok(())
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::WriteRegister { address, value })?;
        state.registers.insert(address, value);
        Ok(())
    }

    async fn write_multiple_coils(&mut self, start: u16, values: &[bool]) -> Result<()> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::WriteCoils {
            start,
            values: values.to_vec(),
        })?;
        check_quantity("coil write", values.len(), MAX_WRITE_COILS)?;
        for (i, v) in values.iter().enumerate() {
            state.coils.insert(start.wrapping_add(i as u16), *v);
        }
        Ok(())
    }

    async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> Result<()> {
        self.wait().await;
        let mut state = self.state.lock();
        state.begin(ModbusCall::WriteRegisters {
            start,
            values: values.to_vec(),
        })?;
        check_quantity("register write", values.len(), MAX_WRITE_REGISTERS)?;
        for (i, v) in values.iter().enumerate() {
            state.registers.insert(start.wrapping_add(i as u16), *v);
        }
        Ok(())
    }
}

/// Recorded S7 transport call
#[derive(Debug, Clone, PartialEq)]
pub enum S7Call {
    Connect,
    Disconnect,
    ReadBytes { db: u16, start: u32, len: u32 },
    WriteBytes { db: u16, start: u32, bytes: Vec<u8> },
    WriteBit { db: u16, byte: u32, bit: u8, value: bool },
}

#[derive(Debug, Default)]
struct S7State {
    blocks: HashMap<u16, Vec<u8>>,
    connected: bool,
    refuse_connect: bool,
    fail_next: Option<BridgeError>,
    endpoint: Option<S7Endpoint>,
    calls: Vec<S7Call>,
}

impl S7State {
    fn begin(&mut self, call: S7Call) -> Result<()> {
        self.calls.push(call);
        if !self.connected {
            return Err(BridgeError::disconnected("mock S7 PLC not connected"));
        }
        if let Some(err) = self.fail_next.take() {
            if err.is_disconnect() {
                self.connected = false;
            }
            return Err(err);
        }
        Ok(())
    }

    fn block_mut(&mut self, db: u16, end: usize) -> Result<&mut Vec<u8>> {
        let block = self
            .blocks
            .get_mut(&db)
            .ok_or_else(|| BridgeError::protocol(format!("S7 object not found: DB{}", db)))?;
        if end > block.len() {
            return Err(BridgeError::protocol(format!(
                "S7 invalid address: DB{} has {} bytes, access ends at {}",
                db,
                block.len(),
                end
            )));
        }
        Ok(block)
    }
}

/// Simulated S7 PLC with fixed-size data blocks
#[derive(Clone, Default)]
pub struct MockS7Transport {
    state: Arc<Mutex<S7State>>,
}

impl MockS7Transport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or replace) a zeroed data block of `size` bytes
    pub fn add_block(&self, db: u16, size: usize) {
        self.state.lock().blocks.insert(db, vec![0; size]);
    }

    pub fn set_bytes(&self, db: u16, start: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        let block = state.blocks.entry(db).or_default();
        if block.len() < start + bytes.len() {
            block.resize(start + bytes.len(), 0);
        }
        block[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn bytes(&self, db: u16, start: usize, len: usize) -> Vec<u8> {
        self.state
            .lock()
            .blocks
            .get(&db)
            .and_then(|b| b.get(start..start + len).map(<[u8]>::to_vec))
            .unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<S7Call> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    pub fn last_endpoint(&self) -> Option<S7Endpoint> {
        self.state.lock().endpoint.clone()
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.state.lock().refuse_connect = refuse;
    }

    pub fn fail_next(&self, err: BridgeError) {
        self.state.lock().fail_next = Some(err);
    }

    pub fn drop_link(&self) {
        self.state.lock().connected = false;
    }
}

#[async_trait]
impl S7Transport for MockS7Transport {
    async fn connect(&mut self, endpoint: &S7Endpoint) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(S7Call::Connect);
        state.endpoint = Some(endpoint.clone());
        if state.refuse_connect {
            state.connected = false;
            return Err(BridgeError::transport(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(S7Call::Disconnect);
        state.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn read_db_bytes(&mut self, db: u16, start: u32, len: u32) -> Result<Vec<u8>> {
        let mut state = self.state.lock();
        state.begin(S7Call::ReadBytes { db, start, len })?;
        let (start, end) = (start as usize, (start + len) as usize);
        let block = state.block_mut(db, end)?;
        Ok(block[start..end].to_vec())
    }

    async fn write_db_bytes(&mut self, db: u16, start: u32, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(S7Call::WriteBytes {
            db,
            start,
            bytes: bytes.to_vec(),
        })?;
        let start = start as usize;
        let block = state.block_mut(db, start + bytes.len())?;
        block[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    async fn write_db_bit(&mut self, db: u16, byte: u32, bit: u8, value: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.begin(S7Call::WriteBit {
            db,
            byte,
            bit,
            value,
        })?;
        let byte = byte as usize;
        let block = state.block_mut(db, byte + 1)?;
        if value {
            block[byte] |= 1 << bit;
        } else {
            block[byte] &= !(1 << bit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> ModbusEndpoint {
        ModbusEndpoint {
            host: "127.0.0.1".to_string(),
            port: 502,
            unit_id: 1,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_mock_modbus_handle_shares_state() {
        let handle = MockModbusTransport::new();
        let mut transport: Box<dyn ModbusTransport> = Box::new(handle.clone());

        transport.connect(&endpoint()).await.unwrap();
        handle.set_registers(10, &[1, 2, 3]);
        assert_eq!(
            transport.read_holding_registers(10, 3).await.unwrap(),
            vec![1, 2, 3]
        );

        transport.write_single_register(4, 99).await.unwrap();
        assert_eq!(handle.register(4), 99);
        assert_eq!(handle.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_modbus_injected_disconnect() {
        let mut mock = MockModbusTransport::new();
        mock.connect(&endpoint()).await.unwrap();
        mock.fail_next(BridgeError::disconnected("cable pulled"));

        assert!(mock.read_coils(0, 8).await.unwrap_err().is_disconnect());
        assert!(!mock.is_connected());
    }

    #[tokio::test]
    async fn test_mock_modbus_rejects_oversized_read() {
        let mut mock = MockModbusTransport::new();
        mock.connect(&endpoint()).await.unwrap();
        assert!(mock.read_holding_registers(0, 126).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_s7_bit_write_keeps_neighbours() {
        let mut mock = MockS7Transport::new();
        mock.add_block(1, 4);
        mock.set_bytes(1, 0, &[0b1000_0001]);
        let endpoint = S7Endpoint {
            host: "127.0.0.1".to_string(),
            port: 102,
            rack: 0,
            slot: 1,
            cpu_type: crate::transport::CpuType::S71200,
            timeout: Duration::from_secs(1),
        };
        mock.connect(&endpoint).await.unwrap();
        mock.write_db_bit(1, 0, 3, true).await.unwrap();
        assert_eq!(mock.bytes(1, 0, 1), vec![0b1000_1001]);
        assert!(mock.read_db_bytes(1, 2, 4).await.is_err());
    }
}
