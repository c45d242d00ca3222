// SPDX-FileCopyrightText: © 2025 Orchard Contributors
//
// SPDX-License-Identifier: MPL-2.0

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text format (faster, lower CPU overhead)
    #[default]
    Text,
    /// JSON format (structured, better for log aggregation but ~2-3x slower)
    Json,
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    /// Format for file logging: "text" (default, faster) or "json" (structured)
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: true,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info, // Debug level has significant CPU overhead
            file_path: "./orchd.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

const fn default_true() -> bool {
    true
}

fn default_cors_allowed_origins() -> Vec<String> {
    vec![
        // Portless localhost (e.g., reverse proxy on 80/443)
        "http://localhost".to_string(),
        "https://localhost".to_string(),
        "http://localhost:*".to_string(),
        "https://localhost:*".to_string(),
        // Portless 127.0.0.1 (e.g., reverse proxy on 80/443)
        "http://127.0.0.1".to_string(),
        "https://127.0.0.1".to_string(),
        "http://127.0.0.1:*".to_string(),
        "https://127.0.0.1:*".to_string(),
    ]
}

/// CORS configuration for cross-origin requests.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct CorsConfig {
    /// Allowed origins for CORS requests and WebSocket upgrades.
    /// Supports wildcards: "http://localhost:*" matches any port on localhost.
    /// Set to `["*"]` to allow all origins (not recommended for production).
    #[serde(default = "default_cors_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self { allowed_origins: default_cors_allowed_origins() }
    }
}

/// Telemetry and observability configuration (OpenTelemetry metrics).
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct TelemetryConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    /// OTLP endpoint for metrics export (e.g., `http://localhost:4318/v1/metrics`).
    /// When unset, metrics are collected but not exported.
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub otlp_headers: HashMap<String, String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enable: true, otlp_endpoint: None, otlp_headers: HashMap::new() }
    }
}

/// HTTP server configuration including TLS and CORS settings.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct ServerConfig {
    pub address: String,
    pub tls: bool,
    pub cert_path: String,
    pub key_path: String,
    /// CORS configuration for cross-origin requests
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:4646".to_string(),
            tls: false,
            cert_path: String::new(),
            key_path: String::new(),
            cors: CorsConfig::default(),
        }
    }
}

const fn default_state_interval() -> u64 {
    1
}

const fn default_disks_interval() -> u64 {
    120
}

const fn default_connections_interval() -> u64 {
    10
}

/// Cadences of the periodic machine-state broadcast loops, in seconds.
///
/// Disk usage is expensive to read from the hypervisor and changes slowly,
/// so its loop runs two orders of magnitude less often than runtime state.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, JsonSchema)]
pub struct WebsocketsConfig {
    #[serde(default = "default_state_interval")]
    pub state_broadcast_interval: u64,
    #[serde(default = "default_disks_interval")]
    pub disks_broadcast_interval: u64,
    #[serde(default = "default_connections_interval")]
    pub connections_broadcast_interval: u64,
}

impl Default for WebsocketsConfig {
    fn default() -> Self {
        Self {
            state_broadcast_interval: default_state_interval(),
            disks_broadcast_interval: default_disks_interval(),
            connections_broadcast_interval: default_connections_interval(),
        }
    }
}

impl WebsocketsConfig {
    pub const fn state_interval(&self) -> Duration {
        Duration::from_secs(self.state_broadcast_interval)
    }

    pub const fn disks_interval(&self) -> Duration {
        Duration::from_secs(self.disks_broadcast_interval)
    }

    pub const fn connections_interval(&self) -> Duration {
        Duration::from_secs(self.connections_broadcast_interval)
    }
}

/// Root configuration for the Orchard server.
#[derive(Deserialize, Serialize, Default, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub websockets: WebsocketsConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the application configuration from defaults, a TOML file, and environment variables.
///
/// # Errors
///
/// Returns an error if:
/// - The configuration file exists but contains invalid TOML syntax
/// - Environment variables are set but contain invalid values
/// - Configuration values fail validation (e.g., invalid types or constraints)
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // Try to load the config file, but don't fail if it doesn't exist
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("ORCH_").split("__")).extract().map_err(Box::new)?;

    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
/// This is extremely unlikely in practice as it would indicate a programming error.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    let default_config = Config::default();
    toml::to_string_pretty(&default_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_intervals_default_to_spec_values() {
        let config = WebsocketsConfig::default();
        assert_eq!(config.state_interval(), Duration::from_secs(1));
        assert_eq!(config.disks_interval(), Duration::from_secs(120));
        assert_eq!(config.connections_interval(), Duration::from_secs(10));
    }

    #[test]
    fn default_config_serializes_to_toml() {
        let toml_string = generate_default().unwrap();
        assert!(toml_string.contains("state_broadcast_interval = 1"));
        assert!(toml_string.contains("disks_broadcast_interval = 120"));
        assert!(toml_string.contains("connections_broadcast_interval = 10"));
    }
}
