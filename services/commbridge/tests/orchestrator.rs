//! Config-driven service wiring with mock transports

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use commbridge::bootstrap::{build_service_with, configure_all};
use commbridge::config::ProtocolConfig;
use commbridge::transport::mock::{MockModbusTransport, MockS7Transport};
use commbridge::{
    AppConfig, LogLevel, ModbusTcpAdapter, PollingState, ProtocolAdapter, ProtocolKind,
    S7Adapter, Value, VariableIds,
};

use common::{drain, has_log};

const CONFIG: &str = r#"
service:
  poll_interval_ms: 100
protocols:
  - name: line
    kind: modbus_tcp
    address_format: h5u
    parameters:
      IP: 127.0.0.1
      Port: 502
  - name: packer
    kind: s7
    parameters:
      IP: 127.0.0.1
      Rack: 0
      Slot: 1
variables:
  - name: speed
    address: D100
    data_type: short
    protocol: line
  - name: running
    address: M3
    data_type: bool
    protocol: line
  - name: tension
    address: DB1.DBD4
    data_type: float
    protocol: packer
  - name: missing
    address: DB7.DBW0
    data_type: short
    protocol: packer
"#;

struct Rig {
    modbus: MockModbusTransport,
    s7: MockS7Transport,
}

impl Rig {
    fn new() -> Self {
        let s7 = MockS7Transport::new();
        s7.add_block(1, 16);
        Self {
            modbus: MockModbusTransport::new(),
            s7,
        }
    }

    fn adapter(&self, protocol: &ProtocolConfig) -> Arc<dyn ProtocolAdapter> {
        match protocol.kind {
            ProtocolKind::ModbusTcp => Arc::new(ModbusTcpAdapter::with_resolver(
                Box::new(self.modbus.clone()),
                protocol.address_format.resolver(),
            )),
            ProtocolKind::S7 => Arc::new(S7Adapter::new(Box::new(self.s7.clone()))),
        }
    }
}

fn load_from_file() -> AppConfig {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = AppConfig::load(file.path()).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test(start_paused = true)]
async fn test_config_driven_polling() {
    let config = load_from_file();
    let rig = Rig::new();
    rig.modbus.set_register(100, 1200);
    rig.modbus.set_coil(3, true);
    rig.s7.set_bytes(1, 4, &0.25f32.to_be_bytes());

    let ids = VariableIds::new();
    let service = build_service_with(&config, &ids, |p| rig.adapter(p));
    let mut logs = service.subscribe_logs();
    assert_eq!(configure_all(&service, &config).await, 2);
    assert_eq!(service.protocol_names(), vec!["line", "packer"]);

    let speed = service.find_variable_by_name("speed").unwrap();
    let mut speed_rx = speed.subscribe();

    assert!(service.start_polling(config.poll_interval()));
    speed_rx.changed().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(speed.value(), Some(Value::Short(1200)));
    assert_eq!(
        service.find_variable_by_name("running").unwrap().value(),
        Some(Value::Bool(true))
    );
    // DB7 does not exist, so the whole packer read fails every cycle
    assert_eq!(service.find_variable_by_name("tension").unwrap().value(), None);

    service.stop_polling().await;
    assert_eq!(service.state(), PollingState::Idle);

    let events = drain(&mut logs);
    assert!(has_log(&events, LogLevel::Error, "'packer'"));
    assert!(events.iter().any(|e| e.source == "packer"));
    assert!(events.iter().any(|e| e.source == "line"));
}

#[tokio::test]
async fn test_write_through_service() {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let rig = Rig::new();
    let ids = VariableIds::new();
    let service = build_service_with(&config, &ids, |p| rig.adapter(p));
    configure_all(&service, &config).await;

    let speed = service.find_variable_by_name("speed").unwrap();
    let tension = service.find_variable_by_name("tension").unwrap();
    speed.set_setpoint(Some(Value::Short(900)));
    tension.set_setpoint(Some(Value::Float(3.5)));

    service.write_batch(&[speed.clone(), tension.clone()]).await.unwrap();

    assert_eq!(rig.modbus.register(100), 900);
    assert_eq!(rig.s7.bytes(1, 4, 4), 3.5f32.to_be_bytes().to_vec());
}

#[tokio::test]
async fn test_failed_connect_is_logged_not_raised() {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let rig = Rig::new();
    rig.s7.refuse_connect(true);
    let ids = VariableIds::new();
    let service = build_service_with(&config, &ids, |p| rig.adapter(p));
    let mut logs = service.subscribe_logs();

    assert_eq!(configure_all(&service, &config).await, 1);
    let events = drain(&mut logs);
    assert!(has_log(&events, LogLevel::Error, "connect failed"));
    assert!(has_log(&events, LogLevel::Warning, "'packer' configured but not connected"));
}

#[tokio::test]
async fn test_disconnect_all() {
    let config = AppConfig::from_yaml_str(CONFIG).unwrap();
    let rig = Rig::new();
    let ids = VariableIds::new();
    let service = build_service_with(&config, &ids, |p| rig.adapter(p));
    configure_all(&service, &config).await;

    service.disconnect_all().await;

    let speed = service.find_variable_by_name("speed").unwrap();
    speed.set_setpoint(Some(Value::Short(1)));
    assert!(service.write(&speed).await.is_err());
}
