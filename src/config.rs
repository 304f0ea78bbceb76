//! Configuration for the IoT Hub MQTT transport
//!
//! A device is configured either from a TOML file (see [`DeviceConfig`]) or
//! from a device connection string (see [`DeviceIdentity::from_connection_string`]).
//! Device keys are never stored in the file; `key_env` names the environment
//! variable that carries the key.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest device id the hub accepts
pub const MAX_DEVICE_ID_LEN: usize = 128;

/// Shortest keepalive the MQTT client accepts
pub const MIN_KEEPALIVE_SECS: u64 = 5;

/// CONNECT carries the keepalive as a 16-bit value
pub const MAX_KEEPALIVE_SECS: u64 = u16::MAX as u64;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub hub: HubSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub forwarder: ForwarderSection,
}

/// Device section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device id registered with the hub
    pub id: String,
    /// Environment variable containing the base64 device key
    pub key_env: String,
}

/// Hub section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubSection {
    /// Hub name, the first label of the host name
    pub name: String,
    /// Domain suffix of the host name
    #[serde(default = "default_hub_suffix")]
    pub suffix: String,
    /// MQTT over TLS port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Session tuning; every field has a default
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    #[serde(default = "default_resend_timeout")]
    pub resend_timeout_secs: u64,
    #[serde(default = "default_max_send_retries")]
    pub max_send_retries: u32,
    #[serde(default = "default_sas_lifetime")]
    pub sas_token_lifetime_secs: u64,
    #[serde(default)]
    pub receive_messages: bool,
    #[serde(default)]
    pub log_trace: bool,
}

/// Sample forwarder settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwarderSection {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default)]
    pub batch: bool,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_hub_suffix() -> String {
    "azure-devices.net".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_keepalive() -> u64 {
    240 // 4 minutes
}

fn default_resend_timeout() -> u64 {
    60
}

fn default_max_send_retries() -> u32 {
    2
}

fn default_sas_lifetime() -> u64 {
    3600
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/eve-forwarder.sock")
}

fn default_read_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    100
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            keepalive_secs: default_keepalive(),
            resend_timeout_secs: default_resend_timeout(),
            max_send_retries: default_max_send_retries(),
            sas_token_lifetime_secs: default_sas_lifetime(),
            receive_messages: false,
            log_trace: false,
        }
    }
}

impl Default for ForwarderSection {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            batch: false,
            read_timeout_secs: default_read_timeout(),
            poll_interval_ms: default_poll_interval(),
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
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(String),
    #[error("Invalid session option: {0}")]
    InvalidSessionOption(String),
}

impl DeviceConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: DeviceConfig = toml::from_str(&content)?;
        validate_device_id(&config.device.id)?;
        validate_keepalive(config.session.keepalive_secs)?;
        Ok(config)
    }

    /// Read the device key from the environment variable named by `key_env`
    pub fn get_device_key(&self) -> Result<String, ConfigError> {
        std::env::var(&self.device.key_env)
            .map_err(|_| ConfigError::EnvVarNotFound(self.device.key_env.clone()))
    }

    /// Resolve the device key and build a validated identity
    pub fn identity(&self) -> Result<DeviceIdentity, ConfigError> {
        let identity = DeviceIdentity {
            device_id: self.device.id.clone(),
            device_key: self.get_device_key()?,
            hub_name: self.hub.name.clone(),
            hub_suffix: self.hub.suffix.clone(),
            port: self.hub.port,
        };
        identity.validate()?;
        Ok(identity)
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions::from(&self.session)
    }
}

/// Static identity of the device a session authenticates as
#[derive(Clone, PartialEq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_key: String,
    pub hub_name: String,
    pub hub_suffix: String,
    pub port: u16,
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("device_id", &self.device_id)
            .field("device_key", &"***")
            .field("hub_name", &self.hub_name)
            .field("hub_suffix", &self.hub_suffix)
            .field("port", &self.port)
            .finish()
    }
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        device_key: impl Into<String>,
        hub_name: impl Into<String>,
        hub_suffix: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_key: device_key.into(),
            hub_name: hub_name.into(),
            hub_suffix: hub_suffix.into(),
            port: default_port(),
        }
    }

    /// Parse `HostName=<hub>.<suffix>;DeviceId=<id>;SharedAccessKey=<key>`
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigError> {
        let mut host_name = None;
        let mut device_id = None;
        let mut device_key = None;

        for part in connection_string.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ConfigError::InvalidConnectionString(format!("segment without '=': {part}"))
            })?;
            match key {
                "HostName" => host_name = Some(value),
                "DeviceId" => device_id = Some(value),
                "SharedAccessKey" => device_key = Some(value),
                _ => {}
            }
        }

        let host_name = host_name
            .ok_or_else(|| ConfigError::InvalidConnectionString("missing HostName".to_string()))?;
        let device_id = device_id
            .ok_or_else(|| ConfigError::InvalidConnectionString("missing DeviceId".to_string()))?;
        let device_key = device_key.ok_or_else(|| {
            ConfigError::InvalidConnectionString("missing SharedAccessKey".to_string())
        })?;
        let (hub_name, hub_suffix) = host_name.split_once('.').ok_or_else(|| {
            ConfigError::InvalidConnectionString(format!(
                "HostName '{host_name}' has no domain suffix"
            ))
        })?;

        let identity = Self::new(device_id, device_key, hub_name, hub_suffix);
        identity.validate()?;
        Ok(identity)
    }

    /// Check the identity fields a session requires
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device_id)?;
        if self.device_key.is_empty() {
            return Err(ConfigError::InvalidIdentity(
                "device key is empty".to_string(),
            ));
        }
        if self.hub_name.is_empty() {
            return Err(ConfigError::InvalidIdentity("hub name is empty".to_string()));
        }
        if self.hub_suffix.is_empty() {
            return Err(ConfigError::InvalidIdentity(
                "hub suffix is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Host the session connects to: `<hub>.<suffix>`
    pub fn host_name(&self) -> String {
        format!("{}.{}", self.hub_name, self.hub_suffix)
    }
}

fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    if device_id.is_empty() || device_id.chars().count() > MAX_DEVICE_ID_LEN {
        return Err(ConfigError::InvalidIdentity(format!(
            "device id must be 1..={MAX_DEVICE_ID_LEN} characters"
        )));
    }
    Ok(())
}

/// Check a keepalive against `MIN_KEEPALIVE_SECS..=MAX_KEEPALIVE_SECS`
pub fn validate_keepalive(secs: u64) -> Result<(), ConfigError> {
    if !(MIN_KEEPALIVE_SECS..=MAX_KEEPALIVE_SECS).contains(&secs) {
        return Err(ConfigError::InvalidSessionOption(format!(
            "keepalive must be {MIN_KEEPALIVE_SECS}..={MAX_KEEPALIVE_SECS} seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Runtime session tuning
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub keepalive_secs: u64,
    pub resend_timeout: Duration,
    pub max_send_retries: u32,
    pub sas_token_lifetime: Duration,
    pub receive_messages: bool,
    pub log_trace: bool,
}

impl SessionOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_keepalive(self.keepalive_secs)
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SessionSection::default())
    }
}

impl From<&SessionSection> for SessionOptions {
    fn from(section: &SessionSection) -> Self {
        Self {
            keepalive_secs: section.keepalive_secs,
            resend_timeout: Duration::from_secs(section.resend_timeout_secs),
            max_send_retries: section.max_send_retries,
            sas_token_lifetime: Duration::from_secs(section.sas_token_lifetime_secs),
            receive_messages: section.receive_messages,
            log_trace: section.log_trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[device]
id = "dev1"
key_env = "DEV1_KEY"

[hub]
name = "myhub"
suffix = "azure-devices.net"
port = 8883

[session]
keepalive_secs = 120
resend_timeout_secs = 30
max_send_retries = 3
receive_messages = true

[forwarder]
socket_path = "/tmp/eve.sock"
batch = true
"#;

        let config: DeviceConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.device.id, "dev1");
        assert_eq!(config.hub.name, "myhub");
        assert_eq!(config.session.keepalive_secs, 120);
        assert_eq!(config.session.max_send_retries, 3);
        assert_eq!(config.session.sas_token_lifetime_secs, 3600);
        assert!(config.session.receive_messages);
        assert!(config.forwarder.batch);
        assert_eq!(config.forwarder.socket_path, PathBuf::from("/tmp/eve.sock"));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let toml_content = r#"
[device]
id = "minimal"
key_env = "MINIMAL_KEY"

[hub]
name = "myhub"
"#;

        let config: DeviceConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.hub.suffix, "azure-devices.net");
        assert_eq!(config.hub.port, 8883);
        assert_eq!(config.session, SessionSection::default());
        assert_eq!(config.forwarder.poll_interval_ms, 100);

        let options = config.session_options();
        assert_eq!(options.keepalive_secs, 240);
        assert_eq!(options.resend_timeout, Duration::from_secs(60));
        assert_eq!(options.max_send_retries, 2);
        assert!(!options.receive_messages);
    }

    #[test]
    fn test_load_from_file_rejects_long_device_id() {
        let long_id = "d".repeat(MAX_DEVICE_ID_LEN + 1);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[device]\nid = \"{long_id}\"\nkey_env = \"K\"\n\n[hub]\nname = \"myhub\"\n"
        )
        .unwrap();

        let result = DeviceConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidIdentity(_))));
    }

    #[test]
    fn test_keepalive_bounds() {
        for secs in [0, 4, 70_000] {
            assert!(matches!(
                validate_keepalive(secs),
                Err(ConfigError::InvalidSessionOption(_))
            ));
        }
        for secs in [MIN_KEEPALIVE_SECS, 240, MAX_KEEPALIVE_SECS] {
            assert!(validate_keepalive(secs).is_ok());
        }
        assert!(SessionOptions::default().validate().is_ok());
    }

    #[test]
    fn test_load_from_file_rejects_short_keepalive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[device]\nid = \"dev1\"\nkey_env = \"K\"\n\n[hub]\nname = \"myhub\"\n\n[session]\nkeepalive_secs = 2\n"
        )
        .unwrap();

        let result = DeviceConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::InvalidSessionOption(_))));
    }

    #[test]
    fn test_load_from_file_missing() {
        let result = DeviceConfig::load_from_file(Path::new("/nonexistent/device.toml"));
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_identity_reads_key_from_env() {
        unsafe {
            std::env::set_var("IOTHUB_MQTT_CONFIG_TEST_KEY", "a2V5MQ==");
        }
        let toml_content = r#"
[device]
id = "dev1"
key_env = "IOTHUB_MQTT_CONFIG_TEST_KEY"

[hub]
name = "myhub"
"#;
        let config: DeviceConfig = toml::from_str(toml_content).unwrap();
        let identity = config.identity().unwrap();
        assert_eq!(identity.device_key, "a2V5MQ==");
        assert_eq!(identity.host_name(), "myhub.azure-devices.net");
    }

    #[test]
    fn test_identity_missing_env() {
        let toml_content = r#"
[device]
id = "dev1"
key_env = "IOTHUB_MQTT_CONFIG_TEST_UNSET"

[hub]
name = "myhub"
"#;
        let config: DeviceConfig = toml::from_str(toml_content).unwrap();
        assert!(matches!(
            config.identity(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_connection_string() {
        let identity = DeviceIdentity::from_connection_string(
            "HostName=myhub.azure-devices.net;DeviceId=dev1;SharedAccessKey=a2V5MQ==",
        )
        .unwrap();

        assert_eq!(identity.hub_name, "myhub");
        assert_eq!(identity.hub_suffix, "azure-devices.net");
        assert_eq!(identity.device_id, "dev1");
        assert_eq!(identity.device_key, "a2V5MQ==");
        assert_eq!(identity.port, 8883);
    }

    #[test]
    fn test_connection_string_order_independent() {
        let identity = DeviceIdentity::from_connection_string(
            "SharedAccessKey=a2V5MQ==;DeviceId=dev1;HostName=myhub.azure-devices.net;",
        )
        .unwrap();
        assert_eq!(identity.device_id, "dev1");
    }

    #[test]
    fn test_connection_string_missing_parts() {
        assert!(matches!(
            DeviceIdentity::from_connection_string("HostName=myhub.azure-devices.net;DeviceId=dev1"),
            Err(ConfigError::InvalidConnectionString(_))
        ));
        assert!(matches!(
            DeviceIdentity::from_connection_string("HostName=myhub;DeviceId=dev1;SharedAccessKey=k"),
            Err(ConfigError::InvalidConnectionString(_))
        ));
        assert!(matches!(
            DeviceIdentity::from_connection_string("garbage"),
            Err(ConfigError::InvalidConnectionString(_))
        ));
    }

    #[test]
    fn test_identity_validation() {
        assert!(DeviceIdentity::new("dev1", "key1", "myhub", "azure-devices.net")
            .validate()
            .is_ok());
        assert!(DeviceIdentity::new("", "key1", "myhub", "azure-devices.net")
            .validate()
            .is_err());
        assert!(DeviceIdentity::new("dev1", "", "myhub", "azure-devices.net")
            .validate()
            .is_err());
        assert!(DeviceIdentity::new("dev1", "key1", "", "azure-devices.net")
            .validate()
            .is_err());
        assert!(DeviceIdentity::new("dev1", "key1", "myhub", "")
            .validate()
            .is_err());

        let max_id = "d".repeat(MAX_DEVICE_ID_LEN);
        assert!(DeviceIdentity::new(max_id, "key1", "myhub", "azure-devices.net")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_identity_debug_hides_key() {
        let identity = DeviceIdentity::new("dev1", "supersecret", "myhub", "azure-devices.net");
        let debug = format!("{identity:?}");
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("dev1"));
    }
}
