//! TOML configuration for the demo binary.
//!
//! Everything has a serde default so a missing or partial file still yields
//! a runnable setup: embedded broker on 1883, client against localhost.

use std::path::{Path, PathBuf};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::session::{Endpoint, ListenOptions};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub port: u16,
    pub bind: String,
    pub tls: BrokerTlsConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 1883,
            bind: "0.0.0.0".to_string(),
            tls: BrokerTlsConfig::default(),
        }
    }
}

/// Listener TLS surface. Carried in config but refused at start; see
/// [`BrokerSession::start`](crate::session::BrokerSession::start).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerTlsConfig {
    pub enabled: bool,
    pub cert: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub ca_file: String,
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            ca_file: String::new(),
            topic: "send/hello".to_string(),
            payload: "hello".to_string(),
            qos: 1,
            retain: false,
        }
    }
}

impl Config {
    /// Loads from `path` if given, else from the user config dir, else
    /// falls back to the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        if let Some(path) = path {
            info!("Loading config from {}", path.display());
            return Self::from_file(path);
        }
        if let Some(default_path) = Self::default_path() {
            if default_path.exists() {
                info!("Loading config from {}", default_path.display());
                return Self::from_file(&default_path);
            }
        }
        debug!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// `$XDG_CONFIG_HOME/mqsession/config.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mqsession").join("config.toml"))
    }

    fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client.qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "client.qos must be 0, 1 or 2 (got {})",
                self.client.qos
            )));
        }
        if self.broker.tls.enabled && (self.broker.tls.cert.is_empty() || self.broker.tls.key.is_empty()) {
            return Err(ConfigError::Invalid(
                "broker.tls.enabled requires cert and key paths".to_string(),
            ));
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            port: self.port,
            bind: self.bind.clone(),
            tls: self.tls.enabled,
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> Endpoint {
        let mut endpoint = Endpoint::new(self.host.clone(), self.port);
        if !self.username.is_empty() {
            endpoint = endpoint.credentials(self.username.clone(), self.password.clone());
        }
        if !self.ca_file.is_empty() {
            endpoint = endpoint.tls(PathBuf::from(&self.ca_file));
        }
        endpoint
    }

    /// Demo publish QoS; `validate` has already bounded the raw number.
    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtLeastOnce,
        }
    }
}
