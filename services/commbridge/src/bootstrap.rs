//! Build a `CommunicationService` from configuration

use std::sync::Arc;

use crate::config::{AppConfig, ProtocolConfig};
use crate::protocols::{ModbusTcpAdapter, ProtocolAdapter, ProtocolKind, S7Adapter};
use crate::service::CommunicationService;
use crate::variable::{Variable, VariableIds};

/// Adapter over the real network transport for a protocol entry
pub fn network_adapter(protocol: &ProtocolConfig) -> Arc<dyn ProtocolAdapter> {
    match protocol.kind {
        ProtocolKind::ModbusTcp => Arc::new(ModbusTcpAdapter::tcp(protocol.address_format.resolver())),
        ProtocolKind::S7 => Arc::new(S7Adapter::tcp()),
    }
}

/// Register one network adapter per protocol entry and create every variable
pub fn build_service(config: &AppConfig, ids: &VariableIds) -> CommunicationService {
    build_service_with(config, ids, network_adapter)
}

/// Same as [`build_service`] with a caller-supplied adapter factory
pub fn build_service_with<F>(config: &AppConfig, ids: &VariableIds, make_adapter: F) -> CommunicationService
where
    F: Fn(&ProtocolConfig) -> Arc<dyn ProtocolAdapter>,
{
    let service = CommunicationService::new();
    for protocol in &config.protocols {
        service.register_protocol(protocol.name.clone(), make_adapter(protocol));
    }

    service.add_variables(config.variables.iter().map(|v| {
        Variable::new(ids, v.name.as_str(), v.address.as_str(), v.data_type, v.protocol.as_str())
    }));
    service
}

/// Configure every protocol entry, returning how many connected
pub async fn configure_all(service: &CommunicationService, config: &AppConfig) -> usize {
    let mut connected = 0;
    for protocol in &config.protocols {
        if service
            .configure_protocol(&protocol.name, &protocol.parameters)
            .await
        {
            connected += 1;
        }
    }
    connected
}
