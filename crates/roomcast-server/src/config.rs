//! Server configuration.
//!
//! Configuration can be loaded from:
//! - An explicit file named by `ROOMCAST_CONFIG`
//! - `roomcast.toml` in the working directory, `/etc/roomcast/` or `~/.config/roomcast/`
//! - Environment variables (`ROOMCAST_HOST`, `ROOMCAST_PORT`) for unset fields

use anyhow::{ensure, Context, Result};
use roomcast_core::{HubConfig, RegistryConfig};
use roomcast_transport::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Keepalive and write deadlines.
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum frame payload in bytes.
    #[serde(default = "default_max_size")]
    pub max_frame_size: usize,

    /// Maximum reassembled message in bytes.
    #[serde(default = "default_max_size")]
    pub max_message_size: usize,

    /// Per-connection outbound queue capacity.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Per-room hub inbox capacity.
    #[serde(default = "default_hub_inbox_capacity")]
    pub hub_inbox_capacity: usize,
}

/// Keepalive configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Time allowed to write a message, in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// Time allowed between pongs, in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Ping interval in milliseconds. Defaults to 90% of `pong_wait_ms`.
    #[serde(default)]
    pub ping_period_ms: Option<u64>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("ROOMCAST_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("ROOMCAST_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_hub_inbox_capacity() -> usize {
    1024
}

fn default_write_wait() -> u64 {
    10_000 // 10 seconds
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            limits: LimitsConfig::default(),
            keepalive: KeepaliveConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_rooms: default_max_rooms(),
            max_frame_size: default_max_size(),
            max_message_size: default_max_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            hub_inbox_capacity: default_hub_inbox_capacity(),
        }
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: None,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl KeepaliveConfig {
    /// Effective ping interval.
    #[must_use]
    pub fn ping_period(&self) -> Duration {
        match self.ping_period_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_millis(self.pong_wait_ms) * 9 / 10,
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed, or
    /// if the resulting configuration is invalid.
    pub fn load() -> Result<Self> {
        let config = match std::env::var("ROOMCAST_CONFIG") {
            Ok(path) => Self::from_file(shellexpand::tilde(&path).as_ref())?,
            Err(_) => Self::from_default_paths()?,
        };

        config.validate()?;
        Ok(config)
    }

    fn from_default_paths() -> Result<Self> {
        let config_paths = [
            "roomcast.toml",
            "/etc/roomcast/roomcast.toml",
            "~/.config/roomcast/roomcast.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
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

    /// Check limits and deadlines for values the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        ensure!(limits.max_frame_size > 0, "limits.max_frame_size must be positive");
        ensure!(
            limits.max_message_size > 0,
            "limits.max_message_size must be positive"
        );
        ensure!(
            limits.outbound_queue_capacity > 0,
            "limits.outbound_queue_capacity must be positive"
        );
        ensure!(
            limits.hub_inbox_capacity > 0,
            "limits.hub_inbox_capacity must be positive"
        );

        let keepalive = &self.keepalive;
        ensure!(keepalive.write_wait_ms > 0, "keepalive.write_wait_ms must be positive");
        ensure!(keepalive.pong_wait_ms > 0, "keepalive.pong_wait_ms must be positive");
        let ping_period = keepalive.ping_period();
        ensure!(
            !ping_period.is_zero() && ping_period < Duration::from_millis(keepalive.pong_wait_ms),
            "keepalive ping period ({ping_period:?}) must be positive and less than pong_wait_ms"
        );

        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Registry settings derived from the limits.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_rooms: self.limits.max_rooms,
            hub: HubConfig {
                inbox_capacity: self.limits.hub_inbox_capacity,
            },
        }
    }

    /// Per-connection settings derived from limits and keepalive.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            write_wait: Duration::from_millis(self.keepalive.write_wait_ms),
            pong_wait: Duration::from_millis(self.keepalive.pong_wait_ms),
            ping_period: self.keepalive.ping_period(),
            outbound_capacity: self.limits.outbound_queue_capacity,
            max_frame_size: self.limits.max_frame_size,
            max_message_size: self.limits.max_message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.limits.max_rooms, 10_000);
        assert_eq!(config.limits.outbound_queue_capacity, 256);
        assert_eq!(config.keepalive.ping_period(), Duration::from_secs(54));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let mut config = Config::default();
        config.host = "127.0.0.1".to_string();
        config.port = 8080;
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        config.host = "not a host".to_string();
        assert!(config.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_rooms = 50
            outbound_queue_capacity = 32

            [keepalive]
            pong_wait_ms = 20000
            ping_period_ms = 15000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_rooms, 50);
        assert_eq!(config.limits.hub_inbox_capacity, 1024);
        assert_eq!(config.keepalive.ping_period(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("roomcast-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[metrics]\nenabled = false\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert!(!config.metrics.enabled);
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.limits.outbound_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.hub_inbox_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_slow_ping() {
        let mut config = Config::default();
        config.keepalive.ping_period_ms = Some(config.keepalive.pong_wait_ms);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_configs() {
        let mut config = Config::default();
        config.limits.max_rooms = 3;
        config.limits.hub_inbox_capacity = 8;
        config.keepalive.pong_wait_ms = 1_000;

        let registry = config.registry_config();
        assert_eq!(registry.max_rooms, 3);
        assert_eq!(registry.hub.inbox_capacity, 8);

        let connection = config.connection_config();
        assert_eq!(connection.pong_wait, Duration::from_secs(1));
        assert_eq!(connection.ping_period, Duration::from_millis(900));
        assert_eq!(connection.outbound_capacity, 256);
    }
}
