//! S7 adapter
//!
//! Reads one byte range per data block, covering every requested element of
//! that block, and decodes values big-endian from the buffer.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use crate::codec;
use crate::error::{BridgeError, Result};
use crate::events::LogSink;
use crate::protocols::{pending_value, ProtocolAdapter, ProtocolKind, ProtocolParams};
use crate::s7_address::{db_spans, ElementKind, S7Address};
use crate::transport::{CpuType, S7Client, S7Endpoint, S7Transport, DEFAULT_TIMEOUT};
use crate::variable::{Value, Variable};

const DEFAULT_PORT: u16 = 102;
const DEFAULT_CPU: CpuType = CpuType::S71200;
const MAX_RACK: u16 = 7;
const MAX_SLOT: u16 = 31;

/// Bytes per coalesced batch write: payload of the smallest PDU (240 - 28)
const MAX_WRITE_RUN: usize = 212;

/// A parsed, type-checked variable address
fn parse_checked(variable: &Variable) -> Result<S7Address> {
    let address = S7Address::parse(variable.address())?;
    codec::check_kind(variable.data_type(), address.kind)?;
    Ok(address)
}

/// Contiguous bytes to write into one data block
#[derive(Debug)]
struct ByteRun {
    db: u16,
    start: u32,
    bytes: Vec<u8>,
    count: usize,
}

impl ByteRun {
    fn end(&self) -> u32 {
        self.start + self.bytes.len() as u32
    }
}

pub struct S7Adapter {
    transport: Mutex<Box<dyn S7Transport>>,
    endpoint: RwLock<Option<S7Endpoint>>,
    sink: RwLock<LogSink>,
}

impl S7Adapter {
    pub fn new(transport: Box<dyn S7Transport>) -> Self {
        Self {
            transport: Mutex::new(transport),
            endpoint: RwLock::new(None),
            sink: RwLock::new(LogSink::new("s7")),
        }
    }

    /// Adapter over the native ISO-on-TCP client
    pub fn tcp() -> Self {
        Self::new(Box::new(S7Client::new()))
    }

    fn sink(&self) -> LogSink {
        self.sink.read().clone()
    }

    fn endpoint_from(params: &ProtocolParams) -> Result<S7Endpoint> {
        let host = params.require_str("IP")?;
        let rack = params.require_u16("Rack")?;
        let slot = params.require_u16("Slot")?;
        if rack > MAX_RACK || slot > MAX_SLOT {
            return Err(BridgeError::config(format!(
                "Rack must be 0..={} and Slot 0..={}, got rack {} slot {}",
                MAX_RACK, MAX_SLOT, rack, slot
            )));
        }
        let port = params.get_u16("Port")?.unwrap_or(DEFAULT_PORT);
        let cpu_type = match params.get_str("CpuType") {
            Some(s) => s.parse()?,
            None => DEFAULT_CPU,
        };
        let timeout = params
            .get_u16("TimeoutMs")?
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(S7Endpoint {
            host,
            port,
            rack,
            slot,
            cpu_type,
            timeout,
        })
    }

    async fn reconnect(&self, sink: &LogSink) -> bool {
        let Some(endpoint) = self.endpoint.read().clone() else {
            sink.error("S7 reconnect impossible: never configured");
            return false;
        };
        match self.transport.lock().await.connect(&endpoint).await {
            Ok(()) => {
                sink.info(format!("S7 reconnected to {}", endpoint));
                true
            },
            Err(e) => {
                sink.error(format!("S7 reconnect to {} failed: {}", endpoint, e));
                false
            },
        }
    }

    async fn read_blocks(&self, variables: &[Arc<Variable>]) -> Result<()> {
        let parsed = variables
            .iter()
            .map(|v| Ok((parse_checked(v)?, v)))
            .collect::<Result<Vec<_>>>()?;

        let spans = db_spans(parsed.iter().map(|(address, _)| address));
        let mut buffers: BTreeMap<u16, (u32, Vec<u8>)> = BTreeMap::new();
        for (db, span) in spans {
            let bytes = self
                .transport
                .lock()
                .await
                .read_db_bytes(db, span.start, span.len())
                .await?;
            buffers.insert(db, (span.start, bytes));
        }

        for (address, variable) in parsed {
            let (base, buffer) = buffers.get(&address.db_number).ok_or_else(|| {
                BridgeError::out_of_range(format!("DB{} was not read", address.db_number))
            })?;
            let value = codec::bytes_to_value(variable.data_type(), &address, buffer, *base)?;
            variable.update_value(Some(value));
        }
        Ok(())
    }

    async fn write_one(&self, address: &S7Address, value: &Value) -> Result<()> {
        let mut transport = self.transport.lock().await;
        match (address.kind, value) {
            (ElementKind::Bit, Value::Bool(b)) => {
                let bit = address.bit_offset.unwrap_or(0);
                transport
                    .write_db_bit(address.db_number, address.byte_offset, bit, *b)
                    .await
            },
            _ => {
                let bytes = codec::value_to_bytes(value, address.kind)?;
                transport
                    .write_db_bytes(address.db_number, address.byte_offset, &bytes)
                    .await
            },
        }
    }

    async fn write_single(&self, variable: &Variable, sink: &LogSink) -> Result<()> {
        let Some(value) = pending_value(variable)? else {
            sink.warn(format!("{}: no setpoint, write skipped", variable));
            return Ok(());
        };
        let address = parse_checked(variable)?;

        if !self.is_connected().await {
            return Err(BridgeError::disconnected("S7 PLC not connected"));
        }

        let started = Instant::now();
        self.write_one(&address, &value).await?;
        sink.debug(format!(
            "Write to {} done in {:?}",
            address,
            started.elapsed()
        ));
        sink.info(format!("{}: wrote {} to {}", variable.name(), value, address));
        Ok(())
    }

    /// Split pending writes into single bits and coalesced byte runs.
    /// Returns the number of rejected variables alongside.
    fn plan_writes(
        variables: &[Arc<Variable>],
        sink: &LogSink,
    ) -> (Vec<(S7Address, bool)>, Vec<ByteRun>, usize) {
        let mut bits = Vec::new();
        let mut elements: BTreeMap<(u16, u32), Vec<u8>> = BTreeMap::new();
        let mut rejected = 0;

        for variable in variables {
            let prepared = pending_value(variable).and_then(|value| match value {
                Some(value) => {
                    let address = parse_checked(variable)?;
                    let bytes = codec::value_to_bytes(&value, address.kind)?;
                    Ok(Some((address, value, bytes)))
                },
                None => Ok(None),
            });
            match prepared {
                Ok(Some((address, Value::Bool(b), _))) => bits.push((address, b)),
                Ok(Some((address, _, bytes))) => {
                    match elements.entry((address.db_number, address.byte_offset)) {
                        Entry::Vacant(slot) => {
                            slot.insert(bytes);
                        },
                        Entry::Occupied(_) => {
                            sink.warn(format!(
                                "{}: duplicate write to DB{} byte {} in one batch, skipped",
                                variable.name(),
                                address.db_number,
                                address.byte_offset
                            ));
                            rejected += 1;
                        },
                    }
                },
                Ok(None) => sink.warn(format!("{}: no setpoint, write skipped", variable)),
                Err(e) => {
                    sink.error(format!("{}: write rejected: {}", variable.name(), e));
                    rejected += 1;
                },
            }
        }

        let mut runs: Vec<ByteRun> = Vec::new();
        for ((db, offset), bytes) in elements {
            if let Some(run) = runs.last_mut() {
                if run.db == db && run.end() > offset {
                    sink.warn(format!(
                        "write to DB{} byte {} overlaps the previous element, skipped",
                        db, offset
                    ));
                    rejected += 1;
                    continue;
                }
                if run.db == db && run.end() == offset && run.bytes.len() + bytes.len() <= MAX_WRITE_RUN {
                    run.bytes.extend_from_slice(&bytes);
                    run.count += 1;
                    continue;
                }
            }
            runs.push(ByteRun {
                db,
                start: offset,
                bytes,
                count: 1,
            });
        }

        (bits, runs, rejected)
    }
}

#[async_trait]
impl ProtocolAdapter for S7Adapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::S7
    }

    fn attach_log_sink(&self, sink: LogSink) {
        *self.sink.write() = sink;
    }

    async fn connect(&self, params: &ProtocolParams) -> bool {
        let sink = self.sink();
        let endpoint = match Self::endpoint_from(params) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                sink.error(format!("S7 connect rejected: {}", e));
                return false;
            },
        };

        sink.info(format!("Connecting S7 PLC {}", endpoint));
        *self.endpoint.write() = Some(endpoint.clone());

        match self.transport.lock().await.connect(&endpoint).await {
            Ok(()) => {
                sink.info(format!("S7 PLC {} connected", endpoint));
                true
            },
            Err(e) => {
                sink.error(format!("S7 PLC {} connect failed: {}", endpoint, e));
                false
            },
        }
    }

    async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    async fn read_variables(&self, variables: &[Arc<Variable>]) -> Result<()> {
        let Some(first) = variables.first() else {
            return Ok(());
        };
        let sink = self.sink();
        let protocol = first.protocol_name();
        let started = Instant::now();

        if !self.is_connected().await {
            sink.warn(format!("{}: S7 PLC not connected, trying to reconnect", protocol));
            self.reconnect(&sink).await;
            return Ok(());
        }

        match self.read_blocks(variables).await {
            Ok(()) => {
                sink.debug(format!(
                    "{}: poll finished in {:?}",
                    protocol,
                    started.elapsed()
                ));
                Ok(())
            },
            Err(e) => {
                if e.is_disconnect() || !self.is_connected().await {
                    sink.error(format!("{}: S7 PLC disconnected: {}", protocol, e));
                    self.reconnect(&sink).await;
                    Ok(())
                } else {
                    sink.error(format!("{}: S7 read error: {}", protocol, e));
                    Err(e)
                }
            },
        }
    }

    async fn write_variable(&self, variable: &Variable) -> Result<()> {
        let sink = self.sink();
        let result = self.write_single(variable, &sink).await;
        if let Err(e) = &result {
            sink.error(format!("{} write failed: {}", variable, e));
        }
        result
    }

    async fn write_variables(&self, variables: &[Arc<Variable>]) -> Result<()> {
        let sink = self.sink();
        let Some(first) = variables.first() else {
            sink.info("Variable list empty, nothing to write");
            return Ok(());
        };
        if !self.is_connected().await {
            sink.error(format!("{} write failed: PLC not connected", first));
            return Err(BridgeError::disconnected("S7 PLC not connected"));
        }

        let started = Instant::now();
        let (bits, runs, rejected) = Self::plan_writes(variables, &sink);
        let mut failed = rejected;
        let total = rejected + bits.len() + runs.len();

        for (address, value) in bits {
            match self.write_one(&address, &Value::Bool(value)).await {
                Ok(()) => sink.info(format!("Wrote {} to {}", value, address)),
                Err(e) => {
                    failed += 1;
                    sink.error(format!("Write of {} failed: {}", address, e));
                },
            }
        }

        for run in runs {
            let result = self
                .transport
                .lock()
                .await
                .write_db_bytes(run.db, run.start, &run.bytes)
                .await;
            match result {
                Ok(()) => sink.info(format!(
                    "Wrote {} values ({} bytes) to DB{} at byte {}",
                    run.count,
                    run.bytes.len(),
                    run.db,
                    run.start
                )),
                Err(e) => {
                    failed += 1;
                    sink.error(format!(
                        "Write of {} bytes to DB{} at byte {} failed: {}",
                        run.bytes.len(),
                        run.db,
                        run.start,
                        e
                    ));
                },
            }
        }

        sink.debug(format!(
            "{}: batch write finished in {:?}",
            first.protocol_name(),
            started.elapsed()
        ));

        if failed > 0 {
            Err(BridgeError::BatchWrite { failed, total })
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.sink().info("Disconnecting S7 PLC");
        self.transport.lock().await.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::LogLevel;
    use crate::transport::mock::MockS7Transport;
    use crate::variable::{DataType, VariableIds};

    fn var(ids: &VariableIds, address: &str, data_type: DataType, sp: Value) -> Arc<Variable> {
        let v = Arc::new(Variable::new(ids, address, address, data_type, "plc"));
        v.set_setpoint(Some(sp));
        v
    }

    #[test]
    fn test_endpoint_defaults() {
        let params = ProtocolParams::new()
            .with("IP", "192.168.0.10")
            .with("Rack", 0)
            .with("Slot", 1);
        let endpoint = S7Adapter::endpoint_from(&params).unwrap();
        assert_eq!(endpoint.port, 102);
        assert_eq!(endpoint.cpu_type, CpuType::S71200);

        let params = params.with("CpuType", "S7-300").with("Port", 1102);
        let endpoint = S7Adapter::endpoint_from(&params).unwrap();
        assert_eq!(endpoint.port, 1102);
        assert_eq!(endpoint.cpu_type, CpuType::S7300);
    }

    #[test]
    fn test_endpoint_requires_rack_and_slot() {
        let params = ProtocolParams::new().with("IP", "192.168.0.10").with("Rack", 0);
        assert!(matches!(
            S7Adapter::endpoint_from(&params),
            Err(BridgeError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_rack_and_slot_out_of_range() {
        let adapter = S7Adapter::new(Box::new(MockS7Transport::new()));
        let sink = LogSink::new("plc");
        let mut logs = sink.subscribe();
        adapter.attach_log_sink(sink);

        for (rack, slot) in [(3000, 1), (8, 1), (0, 32)] {
            let params = ProtocolParams::new()
                .with("IP", "192.168.0.10")
                .with("Rack", rack)
                .with("Slot", slot);
            assert!(!adapter.connect(&params).await);
        }
        let event = logs.try_recv().unwrap();
        assert_eq!(event.level, LogLevel::Error);
        assert!(event.message.contains("Rack must be"));
    }

    #[test]
    fn test_plan_writes_coalesces_contiguous_bytes() {
        let ids = VariableIds::new();
        let sink = LogSink::new("test");
        let vars = vec![
            var(&ids, "DB1.DBW2", DataType::Short, Value::Short(1)),
            var(&ids, "DB1.DBW0", DataType::Short, Value::Short(-1)),
            var(&ids, "DB1.DBD4", DataType::Float, Value::Float(0.5)),
            var(&ids, "DB1.DBW10", DataType::UShort, Value::UShort(7)),
            var(&ids, "DB2.DBB0", DataType::UShort, Value::UShort(9)),
            var(&ids, "DB1.DBX8.1", DataType::Bool, Value::Bool(true)),
        ];

        let (bits, runs, rejected) = S7Adapter::plan_writes(&vars, &sink);
        assert_eq!(rejected, 0);
        assert_eq!(bits.len(), 1);
        let shape: Vec<(u16, u32, usize)> =
            runs.iter().map(|r| (r.db, r.start, r.bytes.len())).collect();
        assert_eq!(shape, vec![(1, 0, 8), (1, 10, 2), (2, 0, 1)]);
        assert_eq!(&runs[0].bytes[..4], &[0xFF, 0xFF, 0x00, 0x01]);
    }

    #[test]
    fn test_plan_writes_rejects_bad_entries() {
        let ids = VariableIds::new();
        let sink = LogSink::new("test");
        let vars = vec![
            var(&ids, "DB1.DBX0.9", DataType::Bool, Value::Bool(true)),
            var(&ids, "DB1.DBW0", DataType::Float, Value::Float(1.0)),
        ];
        let (bits, runs, rejected) = S7Adapter::plan_writes(&vars, &sink);
        assert!(bits.is_empty() && runs.is_empty());
        assert_eq!(rejected, 2);
    }

    #[test]
    fn test_plan_writes_skips_duplicate_and_overlapping_elements() {
        let ids = VariableIds::new();
        let sink = LogSink::new("test");
        let mut logs = sink.subscribe();
        let vars = vec![
            var(&ids, "DB1.DBW0", DataType::Short, Value::Short(1)),
            var(&ids, "DB1.DBW0", DataType::Short, Value::Short(2)),
            var(&ids, "DB1.DBB1", DataType::UShort, Value::UShort(3)),
            var(&ids, "DB1.DBW2", DataType::Short, Value::Short(4)),
        ];

        let (_, runs, rejected) = S7Adapter::plan_writes(&vars, &sink);
        assert_eq!(rejected, 2);
        assert_eq!(runs.len(), 1);
        // first writer wins
        assert_eq!(runs[0].bytes, vec![0x00, 0x01, 0x00, 0x04]);

        let event = logs.try_recv().unwrap();
        assert_eq!(event.level, LogLevel::Warning);
        assert!(event.message.contains("duplicate write to DB1 byte 0"));
        let event = logs.try_recv().unwrap();
        assert!(event.message.contains("overlaps"));
    }
}
