#![deny(unsafe_code)]

//! Configuration loading and validation for onionkeeper.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure:
//! where the daemon keeps its state, how transport plugins are reached, and
//! which bridge lines are available.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon process and control-port configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Transport plugin endpoints.
    #[serde(default)]
    pub transports: TransportConfig,

    /// Bridge selection and bridge lines.
    #[serde(default)]
    pub bridges: BridgesConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the supervised daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Daemon executable, resolved through `PATH` when not absolute.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Daemon data directory. The daemon writes its `lock` file here.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory for the authentication cookie and control-port file.
    #[serde(default = "default_auth_dir")]
    pub auth_dir: PathBuf,

    /// GeoIP (IPv4) database handed to the daemon, if any.
    #[serde(default)]
    pub geoip_file: Option<PathBuf>,

    /// GeoIP (IPv6) database handed to the daemon, if any.
    #[serde(default)]
    pub geoip6_file: Option<PathBuf>,

    /// Memory ceiling for the daemon's internal queues, in MiB.
    #[serde(default = "default_max_mem_in_queues_mb")]
    pub max_mem_in_queues_mb: u32,

    /// Optional notice-level log file written by the daemon itself.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Delay between spawning the daemon and the first control-port attempt.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Deadline for opening the control channel, counted from process start.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            data_dir: default_data_dir(),
            auth_dir: default_auth_dir(),
            geoip_file: None,
            geoip6_file: None,
            max_mem_in_queues_mb: default_max_mem_in_queues_mb(),
            log_file: None,
            settle_delay_ms: default_settle_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_binary() -> String {
    "tor".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data/tor")
}

fn default_auth_dir() -> PathBuf {
    PathBuf::from("data/tor/auth")
}

fn default_max_mem_in_queues_mb() -> u32 {
    5
}

fn default_settle_delay_ms() -> u64 {
    650
}

fn default_connect_timeout_secs() -> u64 {
    30
}

/// Local endpoints of the transport plugins.
///
/// The plugins themselves are managed elsewhere; onionkeeper only needs the
/// SOCKS port each one listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Provisioner: "static" (fixed local ports) or "none" (no plugins).
    #[serde(default = "default_provisioner")]
    pub provisioner: String,

    /// Transport name used with built-in and custom bridge lines.
    #[serde(default = "default_primary_name")]
    pub primary_name: String,

    /// Local SOCKS port of the primary transport plugin.
    #[serde(default = "default_primary_port")]
    pub primary_port: u16,

    /// Transport name of the alternate (fallback) plugin.
    #[serde(default = "default_alternate_name")]
    pub alternate_name: String,

    /// Local SOCKS port of the alternate transport plugin.
    #[serde(default = "default_alternate_port")]
    pub alternate_port: u16,

    /// The single bridge line used with the alternate transport.
    #[serde(default = "default_alternate_bridge")]
    pub alternate_bridge: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            provisioner: default_provisioner(),
            primary_name: default_primary_name(),
            primary_port: default_primary_port(),
            alternate_name: default_alternate_name(),
            alternate_port: default_alternate_port(),
            alternate_bridge: default_alternate_bridge(),
        }
    }
}

fn default_provisioner() -> String {
    "static".to_string()
}

fn default_primary_name() -> String {
    "obfs4".to_string()
}

fn default_primary_port() -> u16 {
    47351
}

fn default_alternate_name() -> String {
    "snowflake".to_string()
}

fn default_alternate_port() -> u16 {
    47352
}

fn default_alternate_bridge() -> String {
    "snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 \
     fingerprint=2B280B23E1107BB62ABFC40DDCC8824814F80A72 \
     url=https://1098762253.rsc.cdn77.org/ fronts=www.cdn77.com,www.phpmyadmin.net \
     ice=stun:stun.antisip.com:3478,stun:stun.epygi.com:3478"
        .to_string()
}

/// Bridge selection.
///
/// ## TOML Example
///
/// ```toml
/// [bridges]
/// mode = "custom"
/// custom = [
///     "obfs4 198.51.100.7:443 0123456789ABCDEF0123456789ABCDEF01234567 cert=... iat-mode=0",
/// ]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgesConfig {
    /// Initial bridge mode: "none", "builtin", "custom", or "alternate".
    #[serde(default = "default_bridge_mode")]
    pub mode: String,

    /// Bridge lines shipped with the application.
    #[serde(default = "default_builtin_bridges")]
    pub builtin: Vec<String>,

    /// Bridge lines supplied by the user.
    #[serde(default)]
    pub custom: Vec<String>,
}

impl Default for BridgesConfig {
    fn default() -> Self {
        Self {
            mode: default_bridge_mode(),
            builtin: default_builtin_bridges(),
            custom: Vec::new(),
        }
    }
}

fn default_bridge_mode() -> String {
    "none".to_string()
}

fn default_builtin_bridges() -> Vec<String> {
    vec![
        "obfs4 192.95.36.142:443 CDF2E852BF539B82BD10E27E9115A31734E378C2 \
         cert=qUVQ0srL1JI/vO6V6m/24anYXiJD3QP2HgzUKQtQ7GRqqUvs7P+tG43RtAqdhLOALP7DJQ iat-mode=1"
            .to_string(),
        "obfs4 85.31.186.98:443 011F2599C0E9B27EE74B353155E244813763C3E5 \
         cert=ayq0XzCwhpdysn5o0EyDUbmSOx3X/oTEbzDMvczHOdBJKlvIdHHLJGkZARtT4dcBFArPPg iat-mode=0"
            .to_string(),
    ]
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Accepted values of `bridges.mode`.
pub const BRIDGE_MODES: [&str; 4] = ["none", "builtin", "custom", "alternate"];

/// Accepted values of `transports.provisioner`.
pub const PROVISIONERS: [&str; 2] = ["static", "none"];

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.binary.is_empty() {
            return Err(ConfigError::Validation(
                "daemon.binary must not be empty".to_string(),
            ));
        }
        if self.daemon.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.data_dir must not be empty".to_string(),
            ));
        }
        if self.daemon.auth_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "daemon.auth_dir must not be empty".to_string(),
            ));
        }
        if self.daemon.connect_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "daemon.connect_timeout_secs must be non-zero".to_string(),
            ));
        }
        if self.daemon.max_mem_in_queues_mb == 0 {
            return Err(ConfigError::Validation(
                "daemon.max_mem_in_queues_mb must be non-zero".to_string(),
            ));
        }

        if !PROVISIONERS.contains(&self.transports.provisioner.as_str()) {
            return Err(ConfigError::Validation(format!(
                "transports.provisioner must be one of {:?}, got {:?}",
                PROVISIONERS, self.transports.provisioner
            )));
        }
        if self.transports.provisioner == "static" {
            if self.transports.primary_port == 0 || self.transports.alternate_port == 0 {
                return Err(ConfigError::Validation(
                    "transports ports must be non-zero".to_string(),
                ));
            }
            if self.transports.primary_name.is_empty() || self.transports.alternate_name.is_empty()
            {
                return Err(ConfigError::Validation(
                    "transports names must not be empty".to_string(),
                ));
            }
        }
        if self.transports.alternate_bridge.trim().is_empty() {
            return Err(ConfigError::Validation(
                "transports.alternate_bridge must not be empty".to_string(),
            ));
        }

        if !BRIDGE_MODES.contains(&self.bridges.mode.as_str()) {
            return Err(ConfigError::Validation(format!(
                "bridges.mode must be one of {:?}, got {:?}",
                BRIDGE_MODES, self.bridges.mode
            )));
        }
        if self.bridges.mode == "custom" && self.bridges.custom.is_empty() {
            return Err(ConfigError::Validation(
                "bridges.custom must list at least one bridge when mode is \"custom\"".to_string(),
            ));
        }
        for (i, line) in self.bridges.custom.iter().enumerate() {
            if line.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "bridges.custom[{i}] must not be empty"
                )));
            }
        }

        Ok(())
    }

    /// Location of the daemon's liveness marker.
    pub fn lock_file(&self) -> PathBuf {
        self.daemon.data_dir.join("lock")
    }

    /// Location of the control-port authentication cookie.
    pub fn cookie_file(&self) -> PathBuf {
        self.daemon.auth_dir.join("control_auth_cookie")
    }

    /// Location of the control-port descriptor the daemon writes on startup.
    pub fn control_port_file(&self) -> PathBuf {
        self.daemon.auth_dir.join("control-port")
    }
}
