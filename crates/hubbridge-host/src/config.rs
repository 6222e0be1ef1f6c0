//! Host configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`$HUBBRIDGE_CONFIG` or a default location)
//! - Environment variables (HUBBRIDGE_*), which override the file

use anyhow::{Context, Result};
use hubbridge_core::RegistryConfig;
use hubbridge_transport::WebSocketConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "HUBBRIDGE_CONFIG";

/// Host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// `tracing` filter directives, used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Connection registry policy.
    #[serde(default)]
    pub registry: RegistrySection,

    /// WebSocket transport tuning.
    #[serde(default)]
    pub websocket: WebSocketSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Connection registry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    /// Restart a connection when its transport reports a timeout.
    #[serde(default = "default_true")]
    pub auto_reconnect_on_timeout: bool,

    /// Maximum number of open connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// WebSocket transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketSection {
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_ms: u64,

    /// Silence after which the server is considered gone.
    #[serde(default = "default_server_timeout")]
    pub server_timeout_ms: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_log_filter() -> String {
    "hubbridge=info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    64
}

fn default_handshake_timeout() -> u64 {
    15_000 // 15 seconds
}

fn default_keep_alive_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_server_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_reconnect_attempts() -> u32 {
    4
}

fn default_reconnect_delay() -> u64 {
    2_000 // 2 seconds
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
            registry: RegistrySection::default(),
            websocket: WebSocketSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            auto_reconnect_on_timeout: true,
            max_connections: default_max_connections(),
        }
    }
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout(),
            keep_alive_interval_ms: default_keep_alive_interval(),
            server_timeout_ms: default_server_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl RegistrySection {
    #[must_use]
    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            auto_reconnect_on_timeout: self.auto_reconnect_on_timeout,
            max_connections: self.max_connections,
        }
    }
}

impl WebSocketSection {
    #[must_use]
    pub fn to_transport_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            server_timeout: Duration::from_millis(self.server_timeout_ms),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            max_message_size: self.max_message_size,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from file or defaults, then apply the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or if
    /// `HUBBRIDGE_CONFIG` names a file that cannot be read.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::from_default_paths()?,
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "hubbridge.toml",
            "/etc/hubbridge/hubbridge.toml",
            "~/.config/hubbridge/hubbridge.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply `HUBBRIDGE_AUTO_RECONNECT` and `HUBBRIDGE_LOG`.
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(flag) = lookup("HUBBRIDGE_AUTO_RECONNECT").as_deref().and_then(parse_flag) {
            self.registry.auto_reconnect_on_timeout = flag;
        }
        if let Some(filter) = lookup("HUBBRIDGE_LOG").filter(|f| !f.trim().is_empty()) {
            self.log_filter = filter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_filter, "hubbridge=info");
        assert!(config.registry.auto_reconnect_on_timeout);
        assert_eq!(config.registry.max_connections, 64);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            log_filter = "hubbridge=debug"

            [registry]
            auto_reconnect_on_timeout = false

            [websocket]
            server_timeout_ms = 10000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.log_filter, "hubbridge=debug");
        assert!(!config.registry.auto_reconnect_on_timeout);
        assert_eq!(config.registry.max_connections, 64);
        assert_eq!(config.websocket.server_timeout_ms, 10_000);
        assert_eq!(config.websocket.reconnect_attempts, 4);
    }

    #[test]
    fn test_transport_config_conversion() {
        let transport = WebSocketSection::default().to_transport_config();
        assert_eq!(transport.handshake_timeout, Duration::from_secs(15));
        assert_eq!(transport.reconnect_delay, Duration::from_secs(2));
        assert_eq!(transport.max_message_size, 1024 * 1024);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("HUBBRIDGE_AUTO_RECONNECT", "off"),
            ("HUBBRIDGE_LOG", "hubbridge=trace"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|key: &str| env.get(key).map(|v| v.to_string()));
        assert!(!config.registry.auto_reconnect_on_timeout);
        assert_eq!(config.log_filter, "hubbridge=trace");

        // Garbage leaves the setting alone.
        let mut config = Config::default();
        config.apply_overrides(|key: &str| {
            (key == "HUBBRIDGE_AUTO_RECONNECT").then(|| "maybe".to_string())
        });
        assert!(config.registry.auto_reconnect_on_timeout);
    }

    #[test]
    fn test_missing_config_file() {
        assert!(Config::from_file("/nonexistent/hubbridge.toml").is_err());
    }
}
