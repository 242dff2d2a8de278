//! Commbridge
//!
//! Polls typed process variables from Modbus-TCP devices and Siemens S7 PLCs
//! and writes setpoints back, using bulk transport calls wherever possible.
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Variables      │───►│  Communication  │───►│  Adapters       │
//! │  (watch values) │    │  Service (poll) │    │  Modbus / S7    │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!                                 │                      │
//!                                 ▼                      ▼
//!                        ┌─────────────────┐    ┌─────────────────┐
//!                        │  Log events     │    │  Transports     │
//!                        │  (broadcast)    │    │  tokio-modbus/ISO│
//!                        └─────────────────┘    └─────────────────┘
//! ```
//!
//! - **`variable`**: typed values, change notification and setpoints
//! - **`planner`** / **`codec`** / **`s7_address`**: pure block planning and marshaling
//! - **`transport`**: byte-level Modbus-TCP and S7 clients, plus in-memory mocks
//!   behind the `test-utils` feature
//! - **`protocols`**: the adapters behind `ProtocolAdapter`
//! - **`service`**: the polling orchestrator

pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod planner;
pub mod protocols;
pub mod s7_address;
pub mod service;
pub mod transport;
pub mod variable;

pub use config::AppConfig;
pub use error::{BridgeError, Result};
pub use events::{LogEvent, LogLevel, LogSink};
pub use protocols::{ModbusTcpAdapter, ProtocolAdapter, ProtocolKind, ProtocolParams, S7Adapter};
pub use service::{CommunicationService, PollingState};
pub use variable::{DataType, Value, Variable, VariableId, VariableIds};
