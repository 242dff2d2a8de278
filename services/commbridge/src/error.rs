//! Error handling for the communication bridge
//!
//! One error type for the whole crate. Connection lifecycle failures never
//! reach callers as errors (they become a `false` return plus a log event),
//! everything else propagates to the direct caller of a read or write.

use thiserror::Error;

/// Communication bridge error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Bad or missing connection parameters, invalid configuration file
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transport lost its connection (detected before or during an operation)
    #[error("Transport disconnected: {0}")]
    TransportDisconnected(String),

    /// Raw buffer or register set does not cover the requested address
    #[error("Address out of range: {0}")]
    AddressOutOfRange(String),

    /// Address string cannot be parsed by the owning adapter
    #[error("Invalid address format: {0}")]
    InvalidAddressFormat(String),

    /// Logical type does not fit the address element kind or the value payload
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// Adapter has no handler for the variable's data type
    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    /// I/O failure while the connection is still considered alive
    #[error("Transport error: {0}")]
    Transport(String),

    /// Controller exception or malformed response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No adapter registered under the variable's protocol name
    #[error("Protocol not registered: {0}")]
    ProtocolNotRegistered(String),

    /// Some runs of a batch write failed; the others were still attempted
    #[error("Batch write failed: {failed} of {total} operations failed")]
    BatchWrite { failed: usize, total: usize },
}

/// Result type alias for the communication bridge
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn config(msg: impl Into<String>) -> Self {
        BridgeError::Configuration(msg.into())
    }

    pub fn disconnected(msg: impl Into<String>) -> Self {
        BridgeError::TransportDisconnected(msg.into())
    }

    pub fn out_of_range(msg: impl Into<String>) -> Self {
        BridgeError::AddressOutOfRange(msg.into())
    }

    pub fn invalid_address(address: impl Into<String>) -> Self {
        BridgeError::InvalidAddressFormat(address.into())
    }

    pub fn type_mismatch(msg: impl Into<String>) -> Self {
        BridgeError::TypeMismatch(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        BridgeError::UnsupportedDataType(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        BridgeError::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BridgeError::Protocol(msg.into())
    }

    pub fn not_registered(name: impl Into<String>) -> Self {
        BridgeError::ProtocolNotRegistered(name.into())
    }

    /// Whether the error means the link is gone and a reconnect is worth trying
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BridgeError::TransportDisconnected(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof => BridgeError::TransportDisconnected(err.to_string()),
            _ => BridgeError::Transport(err.to_string()),
        }
    }
}
