//! Device link configuration
//!
//! Loaded from a YAML or TOML file (chosen by extension) and overlaid with
//! `DEVLINK_` environment variables, `__` separating nested keys:
//!
//! ```text
//! DEVLINK_POOL__MAX_CONNECTIONS=16
//! DEVLINK_LOGGING__LEVEL=debug
//! ```

use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::connection::ConnectionConfig;
use crate::error::{DevLinkError, Result};
use crate::logging::LogConfig;
use crate::manager::PoolConfig;
use crate::mapping::RegisterMapping;
use crate::retry::RetryPolicy;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "DEVLINK_";

/// One polled device: its link, backoff policy and register list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub registers: Vec<RegisterMapping>,
}

impl DeviceConfig {
    pub fn id(&self) -> &str {
        &self.connection.id
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DevLinkConfig {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl DevLinkConfig {
    /// Load from `path` plus environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let extension = path
            .extension()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DevLinkError::config("Config file must have an extension"))?;

        if !path.exists() {
            return Err(DevLinkError::config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        let figment = match extension {
            "toml" => Figment::new().merge(Toml::file(path)),
            "yaml" | "yml" => Figment::new().merge(Yaml::file(path)),
            "json" => Figment::new().merge(Json::file(path)),
            other => {
                return Err(DevLinkError::config(format!(
                    "Unsupported config file format: {other}"
                )))
            },
        };

        let config: Self = figment.merge(Env::prefixed(ENV_PREFIX).split("__")).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text without environment overrides
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Self = Figment::new().merge(Yaml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn device(&self, id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// Check pool settings, device ids and every register mapping
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;

        if self.devices.len() > self.pool.max_connections {
            return Err(DevLinkError::config(format!(
                "{} devices configured but pool holds {}",
                self.devices.len(),
                self.pool.max_connections
            )));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.id()) {
                return Err(DevLinkError::config(format!(
                    "duplicate device id: {}",
                    device.id()
                )));
            }
            device.connection.validate()?;
            device
                .retry
                .validate()
                .map_err(|e| DevLinkError::config(format!("{}: {e}", device.id())))?;

            let mut names = HashSet::new();
            for mapping in &device.registers {
                mapping
                    .validate()
                    .map_err(|e| DevLinkError::config(format!("{}: {e}", device.id())))?;
                if !names.insert(mapping.name.as_str()) {
                    return Err(DevLinkError::config(format!(
                        "{}: duplicate register name {}",
                        device.id(),
                        mapping.name
                    )));
                }
            }
        }
        Ok(())
    }
}
