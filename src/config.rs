//! Device configuration
//!
//! Loaded from a TOML file. The connection string is either inlined or, more
//! usually, named by an environment variable and resolved when the
//! authentication provider is built.

use crate::auth::{AuthError, SymmetricKeyAuthenticationProvider};
use crate::transport::rumqttc_provider::{
    DEFAULT_API_VERSION, DEFAULT_CHANNEL_CAPACITY, DEFAULT_KEEP_ALIVE, DEFAULT_PORT,
};
use crate::transport::ImplicitConnectPolicy;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

static SHARED_ACCESS_KEY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(SharedAccessKey=)[^;]*").expect("key pattern is valid"));

/// Top-level device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub transport: TransportSection,
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Inline connection string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string: Option<String>,
    /// Environment variable holding the connection string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_string_env: Option<String>,
    /// Lifetime of each generated SAS token (default: 3600)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    /// Capacity of the rumqttc request channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            keep_alive_secs: default_keep_alive(),
            use_tls: default_use_tls(),
            channel_capacity: default_channel_capacity(),
            api_version: default_api_version(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Whether sending while disconnected starts a connection
    #[serde(default = "default_connect_on_send")]
    pub connect_on_send: bool,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_on_send: default_connect_on_send(),
        }
    }
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE.as_secs()
}

fn default_use_tls() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_connect_on_send() -> bool {
    true
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid connection string: {0}")]
    Auth(#[from] AuthError),
}

impl DeviceConfig {
    /// Configuration with defaults everywhere and an inline connection string
    pub fn from_connection_string(connection_string: impl Into<String>) -> Self {
        Self {
            device: DeviceSection {
                connection_string: Some(connection_string.into()),
                connection_string_env: None,
                token_ttl_secs: default_token_ttl(),
            },
            mqtt: MqttSection::default(),
            transport: TransportSection::default(),
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match (
            &self.device.connection_string,
            &self.device.connection_string_env,
        ) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::InvalidConfig(
                    "[device] sets both connection_string and connection_string_env".to_string(),
                ))
            }
            (None, None) => {
                return Err(ConfigError::InvalidConfig(
                    "[device] requires connection_string or connection_string_env".to_string(),
                ))
            }
            _ => {}
        }

        if self.device.token_ttl_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "token_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Replace whatever connection string source is configured with `connection_string`
    pub fn override_connection_string(&mut self, connection_string: impl Into<String>) {
        self.device.connection_string = Some(connection_string.into());
        self.device.connection_string_env = None;
    }

    /// Resolve the connection string, reading the environment if needed
    pub fn connection_string(&self) -> Result<String, ConfigError> {
        if let Some(inline) = &self.device.connection_string {
            return Ok(inline.clone());
        }
        match &self.device.connection_string_env {
            Some(name) => Self::get_env_var_required(name),
            None => Err(ConfigError::InvalidConfig(
                "no connection string configured".to_string(),
            )),
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.device.token_ttl_secs)
    }

    pub fn connect_policy(&self) -> ImplicitConnectPolicy {
        ImplicitConnectPolicy::from_flag(self.transport.connect_on_send)
    }

    /// Build the authentication provider for the configured device
    pub fn authentication_provider(
        &self,
    ) -> Result<SymmetricKeyAuthenticationProvider, ConfigError> {
        let provider = SymmetricKeyAuthenticationProvider::from_connection_string(
            &self.connection_string()?,
        )?;
        Ok(provider.with_token_ttl(self.token_ttl()))
    }

    /// TOML rendering with any inline shared access key masked
    pub fn to_redacted_toml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if let Some(inline) = shown.device.connection_string.as_mut() {
            *inline = redact_connection_string(inline);
        }
        Ok(toml::to_string_pretty(&shown)?)
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }
}

/// Mask the `SharedAccessKey` value of a connection string
pub fn redact_connection_string(connection_string: &str) -> String {
    SHARED_ACCESS_KEY
        .replace_all(connection_string, "${1}[REDACTED]")
        .into_owned()
}
