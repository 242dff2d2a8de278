//! Service configuration
//!
//! Loaded from a YAML file with `COMMBRIDGE_`-prefixed environment overrides
//! (`__` separates nesting levels, e.g. `COMMBRIDGE_SERVICE__POLL_INTERVAL_MS`).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::protocols::modbus::AddressFormat;
use crate::protocols::{ProtocolKind, ProtocolParams};
use crate::variable::DataType;

pub const ENV_PREFIX: &str = "COMMBRIDGE_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
    #[serde(default)]
    pub variables: Vec<VariableConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            poll_interval_ms: default_poll_interval_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "commbridge".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One protocol connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub name: String,
    pub kind: ProtocolKind,
    /// Modbus only
    #[serde(default)]
    pub address_format: AddressFormat,
    /// Passed untouched to the adapter's connect
    #[serde(default)]
    pub parameters: ProtocolParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableConfig {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    pub protocol: String,
}

impl AppConfig {
    /// Load from a YAML file merged with environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BridgeError::config(format!(
                "config file {} not found",
                path.display()
            )));
        }
        Self::extract(Figment::new().merge(Yaml::file(path)))
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::extract(Figment::new().merge(Yaml::string(yaml)))
    }

    fn extract(figment: Figment) -> Result<Self> {
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| BridgeError::config(format!("failed to load configuration: {}", e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.service.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.poll_interval_ms == 0 {
            return Err(BridgeError::config("service.poll_interval_ms must be > 0"));
        }

        let mut names = HashSet::new();
        for protocol in &self.protocols {
            if protocol.name.trim().is_empty() {
                return Err(BridgeError::config("protocol name must not be empty"));
            }
            if !names.insert(protocol.name.as_str()) {
                return Err(BridgeError::config(format!(
                    "duplicate protocol name '{}'",
                    protocol.name
                )));
            }
            if protocol.kind == ProtocolKind::S7 && protocol.address_format != AddressFormat::Numeric {
                return Err(BridgeError::config(format!(
                    "protocol '{}': address_format applies to Modbus only",
                    protocol.name
                )));
            }
        }

        for variable in &self.variables {
            if !names.contains(variable.protocol.as_str()) {
                return Err(BridgeError::config(format!(
                    "variable '{}' references undeclared protocol '{}'",
                    variable.name, variable.protocol
                )));
            }
        }
        Ok(())
    }
}
