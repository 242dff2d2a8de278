//! Modbus-TCP adapter
//!
//! Bool variables map to coils; every other type maps to holding registers
//! (one register for 16-bit types, two for 32-bit types, low word first).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::address::{AddressResolver, NumericAddress};
use crate::codec::{self, CoilMap, RegisterMap};
use crate::error::{BridgeError, Result};
use crate::events::LogSink;
use crate::planner::{coalesce_runs, plan_blocks};
use crate::protocols::{pending_value, ProtocolAdapter, ProtocolKind, ProtocolParams};
use crate::transport::limits::{MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS};
use crate::transport::{ModbusEndpoint, ModbusTransport, TokioModbusTransport, DEFAULT_TIMEOUT};
use crate::variable::{DataType, Value, Variable};

const DEFAULT_UNIT_ID: u8 = 1;

/// Start addresses per read for 32-bit values; the trailing high word makes
/// the request one register longer
const MAX_READ_DWORDS: u16 = MAX_READ_REGISTERS - 1;

fn read_limit(data_type: DataType) -> u16 {
    match data_type {
        DataType::Bool => MAX_READ_COILS,
        DataType::Short | DataType::UShort => MAX_READ_REGISTERS,
        DataType::Int32 | DataType::UInt32 | DataType::Float => MAX_READ_DWORDS,
    }
}

/// Values per bulk write
fn write_limit(data_type: DataType) -> usize {
    match data_type {
        DataType::Bool => usize::from(MAX_WRITE_COILS),
        _ => usize::from(MAX_WRITE_REGISTERS / data_type.register_width()),
    }
}

fn group_by_type<'a, V: AsRef<Variable> + 'a>(
    variables: impl IntoIterator<Item = &'a V>,
) -> HashMap<DataType, Vec<&'a Variable>> {
    let mut groups: HashMap<DataType, Vec<&Variable>> = HashMap::new();
    for v in variables {
        let v = v.as_ref();
        groups.entry(v.data_type()).or_default().push(v);
    }
    groups
}

pub struct ModbusTcpAdapter {
    transport: Mutex<Box<dyn ModbusTransport>>,
    resolver: Arc<dyn AddressResolver>,
    endpoint: RwLock<Option<ModbusEndpoint>>,
    sink: RwLock<LogSink>,
}

impl ModbusTcpAdapter {
    pub fn new(transport: Box<dyn ModbusTransport>) -> Self {
        Self::with_resolver(transport, Arc::new(NumericAddress))
    }

    pub fn with_resolver(
        transport: Box<dyn ModbusTransport>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            transport: Mutex::new(transport),
            resolver,
            endpoint: RwLock::new(None),
            sink: RwLock::new(LogSink::new("modbus")),
        }
    }

    /// Adapter over a real `tokio-modbus` TCP client
    pub fn tcp(resolver: Arc<dyn AddressResolver>) -> Self {
        Self::with_resolver(Box::new(TokioModbusTransport::new()), resolver)
    }

    fn sink(&self) -> LogSink {
        self.sink.read().clone()
    }

    fn endpoint_from(params: &ProtocolParams) -> Result<ModbusEndpoint> {
        let host = params.require_str("IP")?;
        let port = params.require_u16("Port")?;
        let unit_id = params.get_u8("UnitId")?.unwrap_or(DEFAULT_UNIT_ID);
        let timeout = params
            .get_u16("TimeoutMs")?
            .map(|ms| Duration::from_millis(u64::from(ms)))
            .unwrap_or(DEFAULT_TIMEOUT);
        Ok(ModbusEndpoint {
            host,
            port,
            unit_id,
            timeout,
        })
    }

    async fn reconnect(&self, sink: &LogSink) -> bool {
        let Some(endpoint) = self.endpoint.read().clone() else {
            sink.error("Modbus reconnect impossible: never configured");
            return false;
        };
        match self.transport.lock().await.connect(&endpoint).await {
            Ok(()) => {
                sink.info(format!("Modbus reconnected to {}", endpoint));
                true
            },
            Err(e) => {
                sink.error(format!("Modbus reconnect to {} failed: {}", endpoint, e));
                false
            },
        }
    }

    fn resolve_all<'a>(&self, group: &[&'a Variable]) -> Result<Vec<(u16, &'a Variable)>> {
        group
            .iter()
            .map(|v| Ok((self.resolver.resolve(v.address())?, *v)))
            .collect()
    }

    async fn read_coil_group(&self, group: &[&Variable]) -> Result<()> {
        let resolved = self.resolve_all(group)?;
        let addresses: Vec<u16> = resolved.iter().map(|(a, _)| *a).collect();

        let mut coils = CoilMap::new();
        for block in plan_blocks(&addresses, MAX_READ_COILS) {
            let values = self
                .transport
                .lock()
                .await
                .read_coils(block.start, block.length)
                .await?;
            codec::merge_coils(&mut coils, block.start, &values);
        }

        for (address, variable) in resolved {
            variable.update_value(Some(codec::coils_to_value(&coils, address)?));
        }
        Ok(())
    }

    async fn read_register_group(&self, data_type: DataType, group: &[&Variable]) -> Result<()> {
        let resolved = self.resolve_all(group)?;
        let addresses: Vec<u16> = resolved.iter().map(|(a, _)| *a).collect();
        let trailing = data_type.register_width() - 1;

        let mut registers = RegisterMap::new();
        for block in plan_blocks(&addresses, read_limit(data_type)) {
            // Never ask past the top of the address space
            let room = u32::from(u16::MAX) - u32::from(block.start) + 1;
            let count = (u32::from(block.length) + u32::from(trailing)).min(room) as u16;
            let values = self
                .transport
                .lock()
                .await
                .read_holding_registers(block.start, count)
                .await?;
            codec::merge_registers(&mut registers, block.start, &values);
        }

        for (address, variable) in resolved {
            let value = codec::registers_to_value(data_type, &registers, address)?;
            variable.update_value(Some(value));
        }
        Ok(())
    }

    async fn read_groups(&self, variables: &[Arc<Variable>]) -> Result<()> {
        for (data_type, group) in group_by_type(variables) {
            match data_type {
                DataType::Bool => self.read_coil_group(&group).await?,
                _ => self.read_register_group(data_type, &group).await?,
            }
        }
        Ok(())
    }

    async fn write_single(&self, variable: &Variable, sink: &LogSink) -> Result<()> {
        let Some(value) = pending_value(variable)? else {
            sink.warn(format!(
                "{}: no setpoint, write skipped",
                variable.name()
            ));
            return Ok(());
        };
        let address = self.resolver.resolve(variable.address())?;

        let mut transport = self.transport.lock().await;
        if !transport.is_connected() {
            return Err(BridgeError::disconnected("Modbus device not connected"));
        }
        match value {
            Value::Bool(b) => transport.write_single_coil(address, b).await?,
            Value::Short(_) | Value::UShort(_) => {
                let words = codec::value_to_registers(&value);
                transport.write_single_register(address, words[0]).await?
            },
            Value::Int32(_) | Value::UInt32(_) | Value::Float(_) => {
                let words = codec::value_to_registers(&value);
                transport.write_multiple_registers(address, &words).await?
            },
        }
        drop(transport);

        sink.info(format!(
            "{}: wrote {} to address {}",
            variable.name(),
            value,
            address
        ));
        Ok(())
    }

    /// Pending `(address, value)` pairs of one type group, sorted by address.
    /// Unset setpoints are skipped; bad entries are logged and counted.
    fn collect_writes(&self, group: &[&Variable], sink: &LogSink) -> (Vec<(u16, Value)>, usize) {
        let mut items = Vec::with_capacity(group.len());
        let mut rejected = 0;
        for variable in group {
            let prepared = pending_value(variable).and_then(|value| {
                let address = self.resolver.resolve(variable.address())?;
                Ok(value.map(|v| (address, v)))
            });
            match prepared {
                Ok(Some(item)) => items.push(item),
                Ok(None) => sink.warn(format!(
                    "{}: no setpoint, write skipped",
                    variable.name()
                )),
                Err(e) => {
                    sink.error(format!("{}: write rejected: {}", variable.name(), e));
                    rejected += 1;
                },
            }
        }
        items.sort_by_key(|(address, _)| *address);
        (items, rejected)
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusTcpAdapter {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ModbusTcp
    }

    fn attach_log_sink(&self, sink: LogSink) {
        *self.sink.write() = sink;
    }

    async fn connect(&self, params: &ProtocolParams) -> bool {
        let sink = self.sink();
        let endpoint = match Self::endpoint_from(params) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                sink.error(format!("Modbus connect rejected: {}", e));
                return false;
            },
        };

        sink.info(format!(
            "Connecting Modbus device {} ({} addressing)",
            endpoint,
            self.resolver.name()
        ));
        *self.endpoint.write() = Some(endpoint.clone());

        match self.transport.lock().await.connect(&endpoint).await {
            Ok(()) => {
                sink.info(format!("Modbus device {} connected", endpoint));
                true
            },
            Err(e) => {
                sink.error(format!("Modbus device {} connect failed: {}", endpoint, e));
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

        if !self.is_connected().await {
            sink.warn(format!("{}: Modbus link down, trying to reconnect", protocol));
            self.reconnect(&sink).await;
            return Ok(());
        }

        let started = Instant::now();
        match self.read_groups(variables).await {
            Ok(()) => {
                sink.debug(format!(
                    "{}: read {} variables in {:?}",
                    protocol,
                    variables.len(),
                    started.elapsed()
                ));
                Ok(())
            },
            Err(e) => {
                if e.is_disconnect() || !self.is_connected().await {
                    sink.error(format!("{}: Modbus server disconnected: {}", protocol, e));
                    self.reconnect(&sink).await;
                    Ok(())
                } else {
                    sink.error(format!("{}: Modbus read error: {}", protocol, e));
                    Err(e)
                }
            },
        }
    }

    async fn write_variable(&self, variable: &Variable) -> Result<()> {
        let sink = self.sink();
        let result = self.write_single(variable, &sink).await;
        if let Err(e) = &result {
            sink.error(format!("{}: Modbus write failed: {}", variable.name(), e));
        }
        result
    }

    async fn write_variables(&self, variables: &[Arc<Variable>]) -> Result<()> {
        let sink = self.sink();
        if variables.is_empty() {
            sink.info("Variable list empty, nothing to write");
            return Ok(());
        }
        if !self.is_connected().await {
            sink.error("Modbus device not connected, batch write aborted");
            return Err(BridgeError::disconnected("Modbus device not connected"));
        }

        let mut failed = 0usize;
        let mut total = 0usize;

        for (data_type, group) in group_by_type(variables) {
            let (items, rejected) = self.collect_writes(&group, &sink);
            failed += rejected;
            total += rejected;
            let width = data_type.register_width();

            for run in coalesce_runs(items, width, write_limit(data_type)) {
                total += 1;
                sink.info(format!(
                    "Writing {} {} values at address {}",
                    run.items.len(),
                    data_type,
                    run.start
                ));

                let result = if data_type == DataType::Bool {
                    let coils: Vec<bool> = run
                        .items
                        .iter()
                        .map(|v| matches!(v, Value::Bool(true)))
                        .collect();
                    self.transport
                        .lock()
                        .await
                        .write_multiple_coils(run.start, &coils)
                        .await
                } else {
                    let words: Vec<u16> =
                        run.items.iter().flat_map(codec::value_to_registers).collect();
                    self.transport
                        .lock()
                        .await
                        .write_multiple_registers(run.start, &words)
                        .await
                };

                match result {
                    Ok(()) => {
                        for (i, value) in run.items.iter().enumerate() {
                            let address = u32::from(run.start) + i as u32 * u32::from(width);
                            sink.info(format!("Wrote {} to address {}", value, address));
                        }
                    },
                    Err(e) => {
                        failed += 1;
                        sink.error(format!(
                            "Write of {} values at address {} failed: {}",
                            run.items.len(),
                            run.start,
                            e
                        ));
                    },
                }
            }
        }

        if failed > 0 {
            Err(BridgeError::BatchWrite { failed, total })
        } else {
            Ok(())
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.sink().info("Disconnecting Modbus device");
        self.transport.lock().await.disconnect().await
    }
}
