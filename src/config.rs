//! Configuration system for the telemetry link
//!
//! The TOML file describes the device identity, broker endpoint, credential
//! lifetime, reconnect policy and publish policy. Secrets (the device private
//! key) are referenced by environment variable or file path and resolved at
//! runtime, never stored in the configuration itself.

use crate::credential::DeviceIdentity;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub credential: CredentialSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub publish: PublishSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    pub project_id: String,
    pub location: String,
    pub registry_id: String,
    /// Device identifier (letter first, then [a-zA-Z0-9._+~%-])
    pub device_id: String,
    /// Environment variable containing the private key material
    pub private_key_env: Option<String>,
    /// File containing the private key material
    pub private_key_file: Option<PathBuf>,
}

/// Broker endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub tls: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_broker_host() -> String {
    "mqtt.2030.ltsapis.goog".to_string()
}

fn default_broker_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    500
}

fn default_operation_timeout() -> u64 {
    1000
}

fn default_max_packet_size() -> usize {
    8 * 1024
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            tls: true,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_ms: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

/// Credential lifetime section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialSection {
    /// Credential validity window (default: 1200 = 20 minutes)
    #[serde(default = "default_validity")]
    pub validity_secs: u64,
    /// Interval of the supervisor's control tick
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    /// Renew when remaining validity drops to this (default: check interval)
    pub renewal_margin_secs: Option<u64>,
}

fn default_validity() -> u64 {
    1200
}

fn default_check_interval() -> u64 {
    60
}

impl Default for CredentialSection {
    fn default() -> Self {
        Self {
            validity_secs: default_validity(),
            check_interval_secs: default_check_interval(),
            renewal_margin_secs: None,
        }
    }
}

impl CredentialSection {
    pub fn renewal_margin_secs(&self) -> u64 {
        self.renewal_margin_secs.unwrap_or(self.check_interval_secs)
    }
}

/// Reconnect backoff section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_min_backoff")]
    pub min_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of each delay added as random jitter (0.0 - 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_min_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            min_backoff_ms: default_min_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Publish policy section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishSection {
    /// How long a publish may wait for a connected session
    #[serde(default = "default_publish_timeout")]
    pub timeout_ms: u64,
    /// Fail fast instead of waiting when not connected
    #[serde(default = "default_true")]
    pub wait_for_connection: bool,
    /// Callers allowed to wait behind the one in service (0 = reject when busy)
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_publish_timeout() -> u64 {
    5000
}

fn default_queue_depth() -> usize {
    1
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_publish_timeout(),
            wait_for_connection: true,
            queue_depth: default_queue_depth(),
        }
    }
}

/// Sensor telemetry loop section (used by the binary)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
    /// Optional events subfolder for telemetry messages
    pub subfolder: Option<String>,
    /// Offset applied to payload timestamps
    #[serde(default)]
    pub utc_offset_hours: i32,
    /// Bounded wait for time sync before starting
    #[serde(default = "default_clock_sync_timeout")]
    pub clock_sync_timeout_secs: u64,
}

fn default_telemetry_interval() -> u64 {
    60
}

fn default_clock_sync_timeout() -> u64 {
    30
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            interval_secs: default_telemetry_interval(),
            subfolder: None,
            utc_offset_hours: 0,
            clock_sync_timeout_secs: default_clock_sync_timeout(),
        }
    }
}

/// Health endpoint section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_health_port() -> u16 {
    8080
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_health_port(),
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
}

impl TelemetryConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: TelemetryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.device_id)?;

        for (name, value) in [
            ("device.project_id", &self.device.project_id),
            ("device.location", &self.device.location),
            ("device.registry_id", &self.device.registry_id),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{name} must not be empty")));
            }
        }

        if self.device.private_key_env.is_none() && self.device.private_key_file.is_none() {
            return Err(ConfigError::InvalidConfig(
                "one of device.private_key_env or device.private_key_file is required".to_string(),
            ));
        }

        let credential = &self.credential;
        if credential.validity_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "credential.validity_secs must be greater than 0".to_string(),
            ));
        }
        if credential.check_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "credential.check_interval_secs must be greater than 0".to_string(),
            ));
        }
        let margin = credential.renewal_margin_secs();
        if margin < credential.check_interval_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "renewal margin ({margin}s) must be at least one check interval ({}s)",
                credential.check_interval_secs
            )));
        }
        if margin >= credential.validity_secs {
            return Err(ConfigError::InvalidConfig(format!(
                "renewal margin ({margin}s) must be shorter than validity ({}s)",
                credential.validity_secs
            )));
        }

        let reconnect = &self.reconnect;
        if reconnect.min_backoff_ms == 0 || reconnect.min_backoff_ms > reconnect.max_backoff_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect backoff requires 0 < min_backoff_ms <= max_backoff_ms".to_string(),
            ));
        }
        if reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return Err(ConfigError::InvalidConfig(
                "reconnect.jitter must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "broker.keep_alive_secs must be at least 5".to_string(),
            ));
        }
        if self.broker.connect_timeout_ms == 0 || self.broker.operation_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Resolve the device private key from its environment variable or file
    pub fn private_key(&self) -> Result<String, ConfigError> {
        if let Some(env_name) = &self.device.private_key_env {
            if let Ok(value) = std::env::var(env_name) {
                return Ok(value);
            }
            if self.device.private_key_file.is_none() {
                return Err(ConfigError::EnvVarNotFound(env_name.clone()));
            }
        }
        match &self.device.private_key_file {
            Some(path) => Ok(std::fs::read_to_string(path)?),
            None => Err(ConfigError::InvalidConfig(
                "no private key source configured".to_string(),
            )),
        }
    }

    /// Build the device identity, resolving the private key
    pub fn device_identity(&self) -> Result<DeviceIdentity, ConfigError> {
        Ok(DeviceIdentity::new(
            self.device.project_id.clone(),
            self.device.location.clone(),
            self.device.registry_id.clone(),
            self.device.device_id.clone(),
            self.private_key()?,
        ))
    }

    /// Runtime supervisor settings derived from this configuration
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            credential_validity: Duration::from_secs(self.credential.validity_secs),
            renewal_margin: Duration::from_secs(self.credential.renewal_margin_secs()),
            check_interval: Duration::from_secs(self.credential.check_interval_secs),
            backoff: BackoffConfig {
                min: Duration::from_millis(self.reconnect.min_backoff_ms),
                max: Duration::from_millis(self.reconnect.max_backoff_ms),
                multiplier: self.reconnect.multiplier,
                jitter: self.reconnect.jitter,
            },
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.broker.operation_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish.timeout_ms),
            wait_for_connection: self.publish.wait_for_connection,
            queue_depth: self.publish.queue_depth,
        }
    }

    /// Runtime transport settings derived from this configuration
    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings {
            host: self.broker.host.clone(),
            port: self.broker.port,
            tls: self.broker.tls,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_millis(self.broker.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.broker.operation_timeout_ms),
            max_packet_size: self.broker.max_packet_size,
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
project_id = "test-project"
location = "us-central1"
registry_id = "test-registry"
device_id = "device-1"
private_key_env = "TEST_DEVICE_PRIVATE_KEY"
"#;
        Self::from_toml(toml_content).expect("Test config should parse")
    }
}

/// Backoff policy for reconnect attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(default_min_backoff()),
            max: Duration::from_millis(default_max_backoff()),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

/// Runtime settings for the connection supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub credential_validity: Duration,
    pub renewal_margin: Duration,
    pub check_interval: Duration,
    pub backoff: BackoffConfig,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub publish_timeout: Duration,
    pub wait_for_connection: bool,
    pub queue_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            credential_validity: Duration::from_secs(default_validity()),
            renewal_margin: Duration::from_secs(default_check_interval()),
            check_interval: Duration::from_secs(default_check_interval()),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_millis(default_connect_timeout()),
            operation_timeout: Duration::from_millis(default_operation_timeout()),
            publish_timeout: Duration::from_millis(default_publish_timeout()),
            wait_for_connection: true,
            queue_depth: default_queue_depth(),
        }
    }
}

/// Runtime settings for the MQTT session
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_packet_size: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        BrokerSection::default().into()
    }
}

impl From<BrokerSection> for BrokerSettings {
    fn from(section: BrokerSection) -> Self {
        Self {
            host: section.host,
            port: section.port,
            tls: section.tls,
            keep_alive: Duration::from_secs(section.keep_alive_secs),
            connect_timeout: Duration::from_millis(section.connect_timeout_ms),
            operation_timeout: Duration::from_millis(section.operation_timeout_ms),
            max_packet_size: section.max_packet_size,
        }
    }
}

/// Validate device ID format: letter first, then letters, digits or `._+~%-`
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let starts_with_letter = device_id
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic());
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._+~%-".contains(c));

    if !starts_with_letter || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must start with a letter and match [a-zA-Z0-9._+~%-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[device]
project_id = "proj"
location = "us-central1"
registry_id = "reg"
device_id = "device-1"
private_key_env = "DEVICE_KEY"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = TelemetryConfig::from_toml(MINIMAL).unwrap();

        assert_eq!(config.device.device_id, "device-1");
        assert_eq!(config.broker.host, "mqtt.2030.ltsapis.goog");
        assert_eq!(config.broker.port, 8883);
        assert!(config.broker.tls);
        assert_eq!(config.credential.validity_secs, 1200);
        assert_eq!(config.credential.renewal_margin_secs(), 60);
        assert_eq!(config.publish.queue_depth, 1);
        assert!(config.publish.wait_for_connection);
        assert!(!config.health.enabled);
    }

    #[test]
    fn test_supervisor_config_conversion() {
        let config = TelemetryConfig::test_config();
        let supervisor = config.supervisor_config();

        assert_eq!(supervisor.credential_validity, Duration::from_secs(1200));
        assert_eq!(supervisor.renewal_margin, supervisor.check_interval);
        assert_eq!(supervisor.connect_timeout, Duration::from_millis(500));
        assert_eq!(supervisor.operation_timeout, Duration::from_millis(1000));
        assert_eq!(supervisor.backoff.min, Duration::from_secs(1));
        assert_eq!(supervisor.backoff.max, Duration::from_secs(60));
        assert_eq!(supervisor, SupervisorConfig::default());
    }

    #[test]
    fn test_invalid_device_id() {
        assert!(validate_device_id("device@1").is_err());
        assert!(validate_device_id("1device").is_err());
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id("esp32.dev_1+a~b%c-d").is_ok());
    }

    #[test]
    fn test_renewal_margin_must_cover_check_interval() {
        let toml_content = format!(
            "{MINIMAL}\n[credential]\ncheck_interval_secs = 60\nrenewal_margin_secs = 30\n"
        );
        let result = TelemetryConfig::from_toml(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_renewal_margin_must_be_shorter_than_validity() {
        let toml_content = format!(
            "{MINIMAL}\n[credential]\nvalidity_secs = 120\nrenewal_margin_secs = 120\n"
        );
        assert!(TelemetryConfig::from_toml(&toml_content).is_err());
    }

    #[test]
    fn test_backoff_bounds_validated() {
        let toml_content =
            format!("{MINIMAL}\n[reconnect]\nmin_backoff_ms = 5000\nmax_backoff_ms = 1000\n");
        assert!(TelemetryConfig::from_toml(&toml_content).is_err());

        let toml_content = format!("{MINIMAL}\n[reconnect]\njitter = 1.5\n");
        assert!(TelemetryConfig::from_toml(&toml_content).is_err());

        let toml_content = format!("{MINIMAL}\n[reconnect]\nmultiplier = 0.5\n");
        assert!(TelemetryConfig::from_toml(&toml_content).is_err());
    }

    #[test]
    fn test_private_key_source_required() {
        let toml_content = r#"
[device]
project_id = "proj"
location = "us-central1"
registry_id = "reg"
device_id = "device-1"
"#;
        assert!(matches!(
            TelemetryConfig::from_toml(toml_content),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_missing_private_key_env_var() {
        let mut config = TelemetryConfig::test_config();
        config.device.private_key_env = Some("TELEMETRY_LINK_UNSET_KEY_VAR".to_string());
        assert!(matches!(
            config.private_key(),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_broker_settings_conversion() {
        let settings = TelemetryConfig::test_config().broker_settings();
        assert_eq!(settings, BrokerSettings::default());
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
    }
}
