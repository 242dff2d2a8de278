//! Modbus-TCP transport over `tokio-modbus`

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{error::Elapsed, timeout};
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use super::{ModbusEndpoint, ModbusTransport, DEFAULT_TIMEOUT};
use crate::error::{BridgeError, Result};

/// Real Modbus-TCP client. Any I/O failure or timeout drops the context, so
/// `is_connected` turns false and the owning adapter can reconnect.
pub struct TokioModbusTransport {
    ctx: Option<Context>,
    timeout: Duration,
}

impl TokioModbusTransport {
    pub fn new() -> Self {
        Self {
            ctx: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    fn context(&mut self) -> Result<&mut Context> {
        self.ctx
            .as_mut()
            .ok_or_else(|| BridgeError::disconnected("Modbus client not connected"))
    }

    fn finish<T>(
        &mut self,
        operation: &str,
        result: std::result::Result<tokio_modbus::Result<T>, Elapsed>,
    ) -> Result<T> {
        match result {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(exception))) => Err(BridgeError::protocol(format!(
                "{} rejected by device: {}",
                operation, exception
            ))),
            Ok(Err(tokio_modbus::Error::Transport(e))) => {
                warn!("Modbus {} I/O failure, dropping connection: {}", operation, e);
                self.ctx = None;
                Err(BridgeError::disconnected(format!("{}: {}", operation, e)))
            },
            Ok(Err(other)) => Err(BridgeError::protocol(format!("{}: {}", operation, other))),
            Err(_) => {
                warn!(
                    "Modbus {} timed out after {:?}, dropping connection",
                    operation, self.timeout
                );
                self.ctx = None;
                Err(BridgeError::disconnected(format!(
                    "{} timed out after {:?}",
                    operation, self.timeout
                )))
            },
        }
    }
}

impl Default for TokioModbusTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModbusTransport for TokioModbusTransport {
    async fn connect(&mut self, endpoint: &ModbusEndpoint) -> Result<()> {
        self.ctx = None;
        self.timeout = endpoint.timeout;

        let target = format!("{}:{}", endpoint.host, endpoint.port);
        let socket_addr = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| BridgeError::config(format!("cannot resolve {}: {}", target, e)))?
            .next()
            .ok_or_else(|| BridgeError::config(format!("no address for {}", target)))?;

        debug!("Connecting Modbus-TCP to {}", endpoint);
        let ctx = timeout(
            endpoint.timeout,
            tcp::connect_slave(socket_addr, Slave(endpoint.unit_id)),
        )
        .await
        .map_err(|_| {
            BridgeError::disconnected(format!(
                "connect to {} timed out after {:?}",
                endpoint, endpoint.timeout
            ))
        })??;

        info!("Modbus-TCP connected to {}", endpoint);
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut ctx) = self.ctx.take() {
            ctx.disconnect().await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    async fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.read_coils(start, count)).await;
        let mut coils = self.finish("read_coils", result)?;
        coils.truncate(usize::from(count));
        Ok(coils)
    }

    async fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.read_holding_registers(start, count)).await;
        self.finish("read_holding_registers", result)
    }

    async fn write_single_coil(&mut self, address: u16, value: bool) -> Result<()> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.write_single_coil(address, value)).await;
        self.finish("write_single_coil", result)
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> Result<()> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.write_single_register(address, value)).await;
        self.finish("write_single_register", result)
    }

    async fn write_multiple_coils(&mut self, start: u16, values: &[bool]) -> Result<()> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.write_multiple_coils(start, values)).await;
        self.finish("write_multiple_coils", result)
    }

    async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> Result<()> {
        let limit = self.timeout;
        let ctx = self.context()?;
        let result = timeout(limit, ctx.write_multiple_registers(start, values)).await;
        self.finish("write_multiple_registers", result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::{ModbusTcpAdapter, NumericAddress, ProtocolAdapter};
    use std::sync::Arc;

    fn assert_shareable<T: Send + Sync + ?Sized>(_: &T) {}

    #[test]
    fn test_network_adapter_is_shareable() {
        let adapter: Arc<dyn ProtocolAdapter> =
            Arc::new(ModbusTcpAdapter::tcp(Arc::new(NumericAddress)));
        assert_shareable(&*adapter);
        assert_shareable(&ModbusTcpAdapter::tcp(Arc::new(NumericAddress)));
    }

    #[tokio::test]
    async fn test_calls_fail_when_not_connected() {
        let mut transport = TokioModbusTransport::new();
        assert!(!transport.is_connected());
        let err = transport.read_holding_registers(0, 1).await.unwrap_err();
        assert!(err.is_disconnect());
        assert!(transport.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut transport = TokioModbusTransport::new();
        let endpoint = ModbusEndpoint {
            host: "127.0.0.1".to_string(),
            port,
            unit_id: 1,
            timeout: Duration::from_millis(500),
        };
        assert!(transport.connect(&endpoint).await.is_err());
        assert!(!transport.is_connected());
    }
}
