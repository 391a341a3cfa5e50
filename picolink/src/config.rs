//! Configuration management for picolink.
//!
//! The configuration document is the JSON file the host-side provisioning tool
//! writes onto the device (`config.json`). It is read once at startup; there
//! is no hot reload. Key names follow the provisioning tool's upper-case
//! convention so existing documents keep working.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cipher::{normalize_key, KEY_LEN};
use crate::error::{Error, Result};
use crate::framing::Framing;
use crate::types::RetryPolicy;

const DEFAULT_PORT: u16 = 50000;
const DEFAULT_SERIAL_DEVICE: &str = "/dev/ttyS0";
const DEFAULT_BAUD: u32 = 19200;
const DEFAULT_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_RECV_LIMIT: usize = 1024;
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Main configuration document.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    /// Wireless network name; absent means the link is managed elsewhere
    #[serde(default)]
    pub wifi_ssid: Option<String>,

    #[serde(default)]
    pub wifi_password: Option<String>,

    /// Remote peer host name or address
    pub ip_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Device identity announced in the handshake
    pub pico_id: DeviceIdentity,

    /// `false` or a pre-shared key string
    #[serde(default)]
    pub encrypt: EncryptSetting,

    /// Mutual TLS material, exclusive with `ENCRYPT`
    #[serde(default)]
    pub tls: Option<TlsPaths>,

    #[serde(default)]
    pub serial: SerialConfig,

    /// Interface the link supervisor watches (e.g. `wlan0`)
    #[serde(default)]
    pub network_interface: Option<String>,

    /// sysfs LED name used as the activity indicator
    #[serde(default)]
    pub led: Option<String>,

    #[serde(default)]
    pub framing: Framing,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_recv_limit")]
    pub recv_limit: usize,

    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Upper bound for exponential backoff; equal to the delay means fixed
    #[serde(default)]
    pub retry_max_delay_secs: Option<u64>,

    /// Give up connecting after this many attempts
    #[serde(default)]
    pub connect_attempts: Option<u32>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_recv_limit() -> usize {
    DEFAULT_RECV_LIMIT
}

fn default_retry_delay_secs() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

/// Opaque device identifier assigned by provisioning.
///
/// The provisioning tool writes it as a string, hand-written documents often
/// use a bare number. Both are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawIdentity", into = "String")]
pub struct DeviceIdentity(String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIdentity {
    Text(String),
    Number(u64),
}

impl From<RawIdentity> for DeviceIdentity {
    fn from(raw: RawIdentity) -> Self {
        match raw {
            RawIdentity::Text(s) => DeviceIdentity(s),
            RawIdentity::Number(n) => DeviceIdentity(n.to_string()),
        }
    }
}

impl From<DeviceIdentity> for String {
    fn from(id: DeviceIdentity) -> Self {
        id.0
    }
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `ENCRYPT` field: `false` or a pre-shared key string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncryptSetting {
    Flag(bool),
    Key(String),
}

impl Default for EncryptSetting {
    fn default() -> Self {
        EncryptSetting::Flag(false)
    }
}

/// Paths to the PEM material for mutual TLS.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct TlsPaths {
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub ca_cert: PathBuf,
}

/// UART settings. Always 8N1.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SerialConfig {
    #[serde(default = "default_serial_device")]
    pub device: String,

    #[serde(default = "default_baud")]
    pub baud: u32,
}

fn default_serial_device() -> String {
    DEFAULT_SERIAL_DEVICE.to_string()
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_serial_device(),
            baud: default_baud(),
        }
    }
}

/// Remote peer address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Network credentials handed to the link supervisor.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Transport security, chosen once at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum TransportSecurityConfig {
    None,
    PresharedKeyStream { key: [u8; KEY_LEN] },
    MutualTls {
        client_cert: PathBuf,
        client_key: PathBuf,
        ca_cert: PathBuf,
    },
}

impl fmt::Debug for TransportSecurityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::PresharedKeyStream { .. } => f.write_str("PresharedKeyStream"),
            Self::MutualTls {
                client_cert,
                client_key,
                ca_cert,
            } => f
                .debug_struct("MutualTls")
                .field("client_cert", client_cert)
                .field("client_key", client_key)
                .field("ca_cert", ca_cert)
                .finish(),
        }
    }
}

impl Config {
    /// Load configuration from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    /// Parse and validate a configuration document.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ip_address.trim().is_empty() {
            return Err(Error::Config("IP_ADDRESS must not be empty".into()));
        }
        if self.port == 0 {
            return Err(Error::Config("PORT must be non-zero".into()));
        }
        if self.pico_id.as_str().is_empty() {
            return Err(Error::Config("PICO_ID must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("POLL_INTERVAL_MS must be non-zero".into()));
        }
        if self.recv_limit == 0 {
            return Err(Error::Config("RECV_LIMIT must be non-zero".into()));
        }
        if self.retry_delay_secs == 0 {
            return Err(Error::Config("RETRY_DELAY_SECS must be non-zero".into()));
        }
        if matches!(self.retry_max_delay_secs, Some(max) if max < self.retry_delay_secs) {
            return Err(Error::Config(
                "RETRY_MAX_DELAY_SECS must not be below RETRY_DELAY_SECS".into(),
            ));
        }
        if self.connect_attempts == Some(0) {
            return Err(Error::Config("CONNECT_ATTEMPTS must be non-zero".into()));
        }
        self.security().map(|_| ())
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.ip_address.trim(), self.port)
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.pico_id
    }

    /// Credentials for the link supervisor, if an SSID is configured.
    pub fn credentials(&self) -> Option<Credentials> {
        self.wifi_ssid
            .as_ref()
            .filter(|ssid| !ssid.is_empty())
            .map(|ssid| Credentials {
                ssid: ssid.clone(),
                password: self.wifi_password.clone().filter(|p| !p.is_empty()),
            })
    }

    /// Resolve the security selector, rejecting conflicting settings.
    pub fn security(&self) -> Result<TransportSecurityConfig> {
        let psk = match &self.encrypt {
            EncryptSetting::Flag(false) => None,
            EncryptSetting::Flag(true) => {
                return Err(Error::Config(
                    "ENCRYPT must be false or a pre-shared key string".into(),
                ))
            }
            EncryptSetting::Key(k) if k.is_empty() => None,
            EncryptSetting::Key(k) => Some(k),
        };

        match (psk, &self.tls) {
            (Some(_), Some(_)) => Err(Error::Config(
                "ENCRYPT and TLS are mutually exclusive".into(),
            )),
            (Some(key), None) => Ok(TransportSecurityConfig::PresharedKeyStream {
                key: normalize_key(key),
            }),
            (None, Some(tls)) => Ok(TransportSecurityConfig::MutualTls {
                client_cert: tls.client_cert.clone(),
                client_key: tls.client_key.clone(),
                ca_cert: tls.ca_cert.clone(),
            }),
            (None, None) => Ok(TransportSecurityConfig::None),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry policy for connect attempts.
    pub fn connect_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        let policy = match self.retry_max_delay_secs {
            Some(max) if max > self.retry_delay_secs => {
                RetryPolicy::exponential(delay, Duration::from_secs(max))
            }
            _ => RetryPolicy::fixed(delay),
        };
        match self.connect_attempts {
            Some(n) => policy.with_max_attempts(n),
            None => policy,
        }
    }
}
