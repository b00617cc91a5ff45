//! Connection configuration
//!
//! A `ConnectionConfig` is built once at startup, either from a TOML file via
//! [`ConnectionConfig::load_from_file`] or programmatically via
//! [`ConnectionConfig::new`], and is read-only afterwards. Secrets are never
//! stored in the file; `auth.password_env` names the environment variable that
//! holds the password and is resolved when credentials are needed.

use crate::protocol::{DEFAULT_MAX_PACKET_SIZE, MAX_REMAINING_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Complete client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionConfig {
    pub broker: BrokerSection,
    pub device: DeviceSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub timeouts: TimeoutSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub quic: QuicSection,
}

/// Where the broker lives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    /// UDP port for MQTT over QUIC
    #[serde(default = "default_quic_port")]
    pub quic_port: u16,
    /// TCP port for MQTT over TLS (8883 for mTLS, 8884 for server-TLS + credentials)
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// TLS server name; defaults to `host`
    pub server_name: Option<String>,
    /// Upper bound on a single MQTT packet in either direction
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_quic_port() -> u16 {
    14567
}

fn default_tcp_port() -> u16 {
    8883
}

fn default_max_packet_size() -> usize {
    DEFAULT_MAX_PACKET_SIZE
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// MQTT client identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

/// Authentication material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AuthSection {
    /// MQTT user name; the device id is used when absent
    pub username: Option<String>,
    /// Environment variable containing the MQTT password
    pub password_env: Option<String>,
    /// PEM bundle of trusted CAs; the platform roots are used when absent
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate chain for mTLS
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`
    pub client_key: Option<PathBuf>,
    /// Disable server certificate verification. Only honoured in builds with
    /// the `dangerous-skip-verify` feature.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Session and resumption behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Ticket file; defaults to `<device id>.ticket.json` in the working directory
    pub ticket_file: Option<PathBuf>,
    /// Present stored tickets for QUIC 0-RTT
    #[serde(default = "default_true")]
    pub enable_0rtt: bool,
    /// Expiry hint written alongside new tickets
    #[serde(default = "default_ticket_lifetime")]
    pub ticket_lifetime_secs: u64,
    /// MQTT clean-session flag sent in CONNECT
    #[serde(default = "default_true")]
    pub clean_session: bool,
}

fn default_true() -> bool {
    true
}

fn default_ticket_lifetime() -> u64 {
    86_400 // 24 hours
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ticket_file: None,
            enable_0rtt: true,
            ticket_lifetime_secs: default_ticket_lifetime(),
            clean_session: true,
        }
    }
}

/// Deadlines for every suspending operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutSection {
    /// QUIC handshake plus CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// TCP connect, TLS handshake plus CONNACK
    #[serde(default = "default_fallback_connect_timeout")]
    pub fallback_connect_timeout_ms: u64,
    /// PUBACK / SUBACK wait
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
    /// PINGREQ interval; 0 disables keep-alive
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
}

fn default_connect_timeout() -> u64 {
    5_000
}

fn default_fallback_connect_timeout() -> u64 {
    10_000
}

fn default_operation_timeout() -> u64 {
    10_000
}

fn default_keep_alive() -> u16 {
    60
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            fallback_connect_timeout_ms: default_fallback_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// Reconnect backoff: `min(initial * multiplier^attempt, max)` with jitter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Fractional jitter applied to each delay (0.2 = ±20%)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
            jitter: default_jitter(),
        }
    }
}

/// QUIC specific tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuicSection {
    /// Topics that get a dedicated stream; further topics share the control stream
    #[serde(default = "default_max_topic_streams")]
    pub max_topic_streams: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
}

fn default_max_topic_streams() -> usize {
    32
}

fn default_idle_timeout() -> u64 {
    30_000
}

impl Default for QuicSection {
    fn default() -> Self {
        Self {
            max_topic_streams: default_max_topic_streams(),
            idle_timeout_ms: default_idle_timeout(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to load TLS material: {0}")]
    Tls(String),
}

/// Resolved MQTT credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

impl ConnectionConfig {
    /// Defaults for everything except the broker host and device id
    pub fn new<H: Into<String>, D: Into<String>>(host: H, device_id: D) -> Self {
        Self {
            broker: BrokerSection {
                host: host.into(),
                quic_port: default_quic_port(),
                tcp_port: default_tcp_port(),
                server_name: None,
                max_packet_size: default_max_packet_size(),
            },
            device: DeviceSection {
                id: device_id.into(),
            },
            auth: AuthSection::default(),
            session: SessionSection::default(),
            timeouts: TimeoutSection::default(),
            reconnect: ReconnectSection::default(),
            quic: QuicSection::default(),
        }
    }

    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConnectionConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field formats and cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.host must not be empty".to_string(),
            ));
        }
        if self.broker.quic_port == 0 || self.broker.tcp_port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker ports must be non-zero".to_string(),
            ));
        }
        if self.broker.max_packet_size < 128 || self.broker.max_packet_size > MAX_REMAINING_LENGTH
        {
            return Err(ConfigError::InvalidConfig(format!(
                "broker.max_packet_size must be between 128 and {MAX_REMAINING_LENGTH}"
            )));
        }

        if self.auth.client_cert.is_some() != self.auth.client_key.is_some() {
            return Err(ConfigError::InvalidConfig(
                "auth.client_cert and auth.client_key must be set together".to_string(),
            ));
        }

        if self.timeouts.connect_timeout_ms == 0
            || self.timeouts.fallback_connect_timeout_ms == 0
            || self.timeouts.operation_timeout_ms == 0
        {
            return Err(ConfigError::InvalidConfig(
                "timeouts must be greater than 0".to_string(),
            ));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must be greater than 0".to_string(),
            ));
        }
        if !(reconnect.multiplier >= 1.0 && reconnect.multiplier.is_finite()) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be a finite number >= 1.0".to_string(),
            ));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_delay_ms must be >= reconnect.initial_delay_ms".to_string(),
            ));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// TLS server name presented in SNI and checked against the certificate
    pub fn server_name(&self) -> &str {
        self.broker
            .server_name
            .as_deref()
            .unwrap_or(&self.broker.host)
    }

    /// Location of the persisted session ticket
    pub fn ticket_path(&self) -> PathBuf {
        self.session
            .ticket_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{}.ticket.json", self.device.id)))
    }

    /// Resolve the user name and the password from the environment
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let password = match &self.auth.password_env {
            Some(name) => Some(
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))?,
            ),
            None => None,
        };
        Ok(Credentials {
            username: self
                .auth
                .username
                .clone()
                .unwrap_or_else(|| self.device.id.clone()),
            password,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_timeout_ms)
    }

    pub fn fallback_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.fallback_connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.operation_timeout_ms)
    }

    /// `None` when keep-alive is disabled
    pub fn keep_alive(&self) -> Option<Duration> {
        match self.timeouts.keep_alive_secs {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        }
    }
}

/// Validate device ID format
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
