//! Application configuration
//!
//! Loaded from a TOML file; every field has a sensible default so an empty
//! file (or no file at all) yields a working development setup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::domain::RegistrationStatus;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Admission policy for BootNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootAdmission {
    Accepted,
    Pending,
    Rejected,
}

impl BootAdmission {
    pub fn registration_status(self) -> RegistrationStatus {
        match self {
            BootAdmission::Accepted => RegistrationStatus::Accepted,
            BootAdmission::Pending => RegistrationStatus::Pending,
            BootAdmission::Rejected => RegistrationStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub host: String,
    /// Listen port
    pub port: u16,
}

impl ServerConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OcppConfig {
    /// Heartbeat interval advertised in BootNotification responses, seconds
    pub heartbeat_interval_secs: u32,
    /// Extra slack past the heartbeat interval before a silent connection
    /// is considered dead, seconds
    pub heartbeat_grace_secs: u32,
    /// Default timeout for central-system-initiated Calls, seconds
    pub call_timeout_secs: u64,
    /// Interval of the per-connection pending-call sweep, seconds
    pub sweep_interval_secs: u64,
    /// BootNotification admission policy
    pub boot_status: BootAdmission,
}

impl Default for OcppConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 300,
            heartbeat_grace_secs: 60,
            call_timeout_secs: 30,
            sweep_interval_secs: 5,
            boot_status: BootAdmission::Accepted,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive, e.g. "info" or "ocpp_csms=debug"
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub ocpp: OcppConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

/// Platform config file location, e.g. `~/.config/ocpp-csms/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-csms")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.address(), "0.0.0.0:9000");
        assert_eq!(config.ocpp.heartbeat_interval_secs, 300);
        assert_eq!(config.ocpp.boot_status, BootAdmission::Accepted);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: AppConfig = toml::from_str(
            r#"
            [server]
            port = 8887

            [ocpp]
            boot_status = "pending"
            call_timeout_secs = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8887);
        assert_eq!(config.ocpp.boot_status, BootAdmission::Pending);
        assert_eq!(config.ocpp.call_timeout_secs, 10);
        assert_eq!(config.ocpp.sweep_interval_secs, 5);
    }

    #[test]
    fn boot_admission_maps_to_registration_status() {
        assert_eq!(
            BootAdmission::Rejected.registration_status(),
            RegistrationStatus::Rejected
        );
    }
}
