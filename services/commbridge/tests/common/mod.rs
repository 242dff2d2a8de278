//! Shared helpers for commbridge integration tests

#![allow(dead_code)]

use std::sync::Arc;

use commbridge::protocols::modbus::AddressResolver;
use commbridge::transport::mock::{MockModbusTransport, MockS7Transport};
use commbridge::{
    DataType, LogEvent, LogLevel, LogSink, ModbusTcpAdapter, ProtocolAdapter, ProtocolParams,
    S7Adapter, Value, Variable, VariableIds,
};
use tokio::sync::broadcast;

pub fn modbus_params() -> ProtocolParams {
    ProtocolParams::new()
        .with("IP", "127.0.0.1")
        .with("Port", 502)
}

pub fn s7_params() -> ProtocolParams {
    ProtocolParams::new()
        .with("IP", "127.0.0.1")
        .with("Rack", 0)
        .with("Slot", 1)
}

/// Connected Modbus adapter over a mock device, with its log stream
pub async fn modbus_adapter(
    resolver: Option<Arc<dyn AddressResolver>>,
) -> (ModbusTcpAdapter, MockModbusTransport, broadcast::Receiver<LogEvent>) {
    let mock = MockModbusTransport::new();
    let adapter = match resolver {
        Some(resolver) => ModbusTcpAdapter::with_resolver(Box::new(mock.clone()), resolver),
        None => ModbusTcpAdapter::new(Box::new(mock.clone())),
    };
    let sink = LogSink::new("plc");
    let logs = sink.subscribe();
    adapter.attach_log_sink(sink);
    assert!(adapter.connect(&modbus_params()).await);
    mock.clear_calls();
    (adapter, mock, logs)
}

/// Connected S7 adapter over a mock PLC with DB1 and DB2 of 64 bytes
pub async fn s7_adapter() -> (S7Adapter, MockS7Transport, broadcast::Receiver<LogEvent>) {
    let mock = MockS7Transport::new();
    mock.add_block(1, 64);
    mock.add_block(2, 64);
    let adapter = S7Adapter::new(Box::new(mock.clone()));
    let sink = LogSink::new("plc");
    let logs = sink.subscribe();
    adapter.attach_log_sink(sink);
    assert!(adapter.connect(&s7_params()).await);
    mock.clear_calls();
    (adapter, mock, logs)
}

pub fn var(ids: &VariableIds, address: &str, data_type: DataType) -> Arc<Variable> {
    Arc::new(Variable::new(ids, format!("var_{}", address), address, data_type, "plc"))
}

pub fn var_with(ids: &VariableIds, address: &str, data_type: DataType, setpoint: Value) -> Arc<Variable> {
    let v = var(ids, address, data_type);
    v.set_setpoint(Some(setpoint));
    v
}

/// Everything currently buffered on a log receiver
pub fn drain(logs: &mut broadcast::Receiver<LogEvent>) -> Vec<LogEvent> {
    let mut events = Vec::new();
    while let Ok(event) = logs.try_recv() {
        events.push(event);
    }
    events
}

pub fn has_log(events: &[LogEvent], level: LogLevel, needle: &str) -> bool {
    events
        .iter()
        .any(|e| e.level == level && e.message.contains(needle))
}
