//! Commbridge basic library
//!
//! Provides functions shared by all services:
//! - logging bootstrap (console + daily rolling file)
//! - graceful shutdown signal handling

pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig};
pub use shutdown::{wait_for_shutdown, ShutdownSignal};
