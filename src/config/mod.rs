//! Configuration management
//!
//! The server is configured by a single URL of the form
//!
//! ```text
//! server://<tunnel-addr>/<target-addr>?tls=<code>&crt=<path>&key=<path>
//! ```
//!
//! where `<tunnel-addr>` is where the remote client connects in (control
//! channel and all data channels) and `<target-addr>` is where local peers
//! reach the tunneled service, bound for both TCP and UDP. Tunables and
//! logging options come from an optional TOML settings file.

use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Unsupported scheme: {0} (expected server://)")]
    InvalidScheme(String),

    #[error("Missing tunnel host in configuration URL")]
    MissingHost,

    #[error("Missing tunnel port in configuration URL")]
    MissingPort,

    #[error("Missing target address in configuration URL path")]
    MissingTarget,

    #[error("Unresolvable address: {0}")]
    Unresolvable(String),

    #[error("Failed to read settings: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Listen addresses and TLS mode resolved from the configuration URL.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the remote client connects in on (control + data channels)
    pub tunnel_addr: SocketAddr,
    /// Address local TCP peers connect to
    pub target_tcp_addr: SocketAddr,
    /// Address local UDP peers send to
    pub target_udp_addr: SocketAddr,
    /// Opaque cipher-selection code echoed to the client at handshake
    pub tls_code: String,
    /// Certificate chain path (TLS mode "2")
    pub cert_path: Option<PathBuf>,
    /// Private key path (TLS mode "2")
    pub key_path: Option<PathBuf>,
}

impl ServerConfig {
    /// Resolve a configuration URL into listen addresses.
    pub fn from_url(raw: &str) -> Result<Self, ConfigError> {
        let url = Url::parse(raw)?;

        if url.scheme() != "server" {
            return Err(ConfigError::InvalidScheme(url.scheme().to_string()));
        }

        let host = url.host_str().ok_or(ConfigError::MissingHost)?;
        let port = url.port().ok_or(ConfigError::MissingPort)?;
        let tunnel_addr = resolve(&format!("{}:{}", host, port))?;

        let target = url.path().trim_start_matches('/');
        if target.is_empty() {
            return Err(ConfigError::MissingTarget);
        }
        let target_tcp_addr = resolve(target)?;
        let target_udp_addr = target_tcp_addr;

        let mut tls_code = "0".to_string();
        let mut cert_path = None;
        let mut key_path = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "tls" => tls_code = value.into_owned(),
                "crt" => cert_path = Some(PathBuf::from(value.into_owned())),
                "key" => key_path = Some(PathBuf::from(value.into_owned())),
                _ => {}
            }
        }

        Ok(Self {
            tunnel_addr,
            target_tcp_addr,
            target_udp_addr,
            tls_code,
            cert_path,
            key_path,
        })
    }
}

fn resolve(addr: &str) -> Result<SocketAddr, ConfigError> {
    addr.to_socket_addrs()
        .map_err(|_| ConfigError::Unresolvable(addr.to_string()))?
        .next()
        .ok_or_else(|| ConfigError::Unresolvable(addr.to_string()))
}

/// Settings file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Tunable limits and intervals
    pub tunables: Tunables,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Tunable limits and intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    /// Maximum number of in-flight relay workers
    pub semaphore_limit: usize,
    /// How often idle pool channels are invalidated, in milliseconds
    pub reload_interval_ms: u64,
    /// Keepalive and checkpoint cadence, in milliseconds
    pub report_interval_ms: u64,
    /// Buffer size for a single UDP exchange; larger responses are truncated
    pub udp_buf_size: usize,
    /// Pause between a failed start and the next attempt, in milliseconds
    pub service_cooldown_ms: u64,
    /// Upper bound on graceful shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            semaphore_limit: 1024,
            reload_interval_ms: 3_600_000,
            report_interval_ms: 5_000,
            udp_buf_size: 8192,
            service_cooldown_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl Tunables {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_millis(self.reload_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn service_cooldown(&self) -> Duration {
        Duration::from_millis(self.service_cooldown_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_url() {
        let config =
            ServerConfig::from_url("server://0.0.0.0:10101/127.0.0.1:8080?tls=2&crt=/a.pem&key=/b.pem")
                .unwrap();

        assert_eq!(config.tunnel_addr, "0.0.0.0:10101".parse().unwrap());
        assert_eq!(config.target_tcp_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.target_udp_addr, config.target_tcp_addr);
        assert_eq!(config.tls_code, "2");
        assert_eq!(config.cert_path, Some(PathBuf::from("/a.pem")));
        assert_eq!(config.key_path, Some(PathBuf::from("/b.pem")));
    }

    #[test]
    fn test_tls_defaults_to_plaintext() {
        let config = ServerConfig::from_url("server://127.0.0.1:10101/127.0.0.1:8080").unwrap();
        assert_eq!(config.tls_code, "0");
        assert!(config.cert_path.is_none());
    }

    #[test]
    fn test_rejects_wrong_scheme() {
        let err = ServerConfig::from_url("client://127.0.0.1:10101/127.0.0.1:8080").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidScheme(_)));
    }

    #[test]
    fn test_rejects_missing_target() {
        let err = ServerConfig::from_url("server://127.0.0.1:10101").unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));

        let err = ServerConfig::from_url("server://127.0.0.1:10101/").unwrap_err();
        assert!(matches!(err, ConfigError::MissingTarget));
    }

    #[test]
    fn test_rejects_missing_port() {
        let err = ServerConfig::from_url("server://127.0.0.1/127.0.0.1:8080").unwrap_err();
        assert!(matches!(err, ConfigError::MissingPort));
    }

    #[test]
    fn test_tunables_defaults() {
        let tunables = Tunables::default();
        assert_eq!(tunables.semaphore_limit, 1024);
        assert_eq!(tunables.reload_interval(), Duration::from_secs(3600));
        assert_eq!(tunables.report_interval(), Duration::from_secs(5));
        assert_eq!(tunables.udp_buf_size, 8192);
    }

    #[test]
    fn test_settings_from_toml() {
        let settings: Settings = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [tunables]
            semaphore_limit = 64
            report_interval_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.tunables.semaphore_limit, 64);
        assert_eq!(settings.tunables.report_interval(), Duration::from_secs(1));
        // Unset fields keep their defaults
        assert_eq!(settings.tunables.udp_buf_size, 8192);
    }
}
