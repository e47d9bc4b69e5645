//! Configuration for the tracker
//!
//! Loaded from a TOML file. Every section except `[device]` and `[mqtt]` has
//! defaults, so a minimal file names the device and the broker and nothing
//! else.

use crate::protocol::{CellularSnapshot, Topics, TopicError, DEFAULT_MAX_TOPIC_LEN};
use crate::transport::queue::DEFAULT_QUEUE_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Paths searched when no config file is given on the command line
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["trackerlink.toml", "config/trackerlink.toml"];

/// Upper bound for every configured delay and timeout (one week)
pub const MAX_TIMER_SECS: u64 = 7 * 24 * 60 * 60;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrackerConfig {
    pub device: DeviceSection,
    pub mqtt: MqttSection,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub modem: CellularSnapshot,
    #[serde(default)]
    pub update: UpdateSection,
    #[serde(default)]
    pub location: LocationSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Unique device identity, used in every topic and as the client id
    pub identity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub broker_url: String,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// How generic payloads reach the broker
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GenericDispatch {
    /// Always queue and let the drain publish
    #[default]
    Queued,
    /// Publish immediately while connected, queue otherwise
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSection {
    /// Last topic segment for generic payloads
    #[serde(default = "default_generic_topic")]
    pub generic_topic: String,
    /// Wait between network attach and the first connect attempt
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,
    /// Period of the self-rearming connect attempt
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout_secs: u64,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_inbox_depth")]
    pub inbox_depth: usize,
    /// Bound on producer publishes onto the bus
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    /// Bound on reading a just-signalled channel
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_topic_len")]
    pub max_topic_len: usize,
    #[serde(default)]
    pub generic_dispatch: GenericDispatch,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            generic_topic: default_generic_topic(),
            settle_delay_secs: default_settle_delay(),
            reconnect_timeout_secs: default_reconnect_timeout(),
            queue_depth: default_queue_depth(),
            inbox_depth: default_inbox_depth(),
            publish_timeout_secs: default_publish_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_topic_len: default_max_topic_len(),
            generic_dispatch: GenericDispatch::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateSection {
    /// Base URL of the firmware file server
    #[serde(default = "default_update_host")]
    pub host: String,
}

impl Default for UpdateSection {
    fn default() -> Self {
        Self {
            host: default_update_host(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocationSection {
    /// JSON-lines file of recorded fixes to replay
    pub fixes_file: Option<PathBuf>,
    /// Delay between replayed fixes
    #[serde(default = "default_fix_interval")]
    pub fix_interval_ms: u64,
}

impl Default for LocationSection {
    fn default() -> Self {
        Self {
            fixes_file: None,
            fix_interval_ms: default_fix_interval(),
        }
    }
}

fn default_keep_alive() -> u64 {
    60
}

fn default_generic_topic() -> String {
    "data".to_string()
}

fn default_settle_delay() -> u64 {
    5
}

fn default_reconnect_timeout() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_inbox_depth() -> usize {
    crate::bus::DEFAULT_INBOX_DEPTH
}

fn default_publish_timeout() -> u64 {
    1
}

fn default_read_timeout() -> u64 {
    1
}

fn default_max_topic_len() -> usize {
    DEFAULT_MAX_TOPIC_LEN
}

fn default_update_host() -> String {
    "http://localhost:8080".to_string()
}

fn default_fix_interval() -> u64 {
    1000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid device identity: {0}")]
    InvalidIdentity(#[from] TopicError),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("No configuration file found in {0:?}")]
    NotFound(Vec<String>),
}

impl TrackerConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TrackerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the config file: the explicit path, else the first default that exists
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
            .ok_or_else(|| {
                ConfigError::NotFound(DEFAULT_CONFIG_PATHS.iter().map(|s| s.to_string()).collect())
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // Deriving the topics up front surfaces identity and capacity problems at startup
        self.topics()?;
        parse_broker_url(&self.mqtt.broker_url)?;

        if self.transport.queue_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.queue_depth must be at least 1".to_string(),
            ));
        }
        if self.transport.inbox_depth == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.inbox_depth must be at least 1".to_string(),
            ));
        }
        if self.transport.reconnect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "transport.reconnect_timeout_secs must be at least 1".to_string(),
            ));
        }
        for (name, secs) in [
            ("transport.settle_delay_secs", self.transport.settle_delay_secs),
            ("transport.reconnect_timeout_secs", self.transport.reconnect_timeout_secs),
            ("transport.publish_timeout_secs", self.transport.publish_timeout_secs),
            ("transport.read_timeout_secs", self.transport.read_timeout_secs),
        ] {
            if secs > MAX_TIMER_SECS {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be at most {MAX_TIMER_SECS}"
                )));
            }
        }
        // MQTT carries keep-alive as a 16-bit second count
        if self.mqtt.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keep_alive_secs must be at most {}",
                u16::MAX
            )));
        }
        Url::parse(&self.update.host)
            .map_err(|e| ConfigError::InvalidConfig(format!("update.host: {e}")))?;
        Ok(())
    }

    pub fn topics(&self) -> Result<Topics, TopicError> {
        Topics::derive(
            &self.device.identity,
            &self.transport.generic_topic,
            self.transport.max_topic_len,
        )
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.transport.settle_delay_secs)
    }

    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.reconnect_timeout_secs)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.publish_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.read_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.mqtt.keep_alive_secs)
    }

    fn env_var(name: Option<&String>) -> Option<String> {
        name.and_then(|name| std::env::var(name).ok())
    }

    pub fn mqtt_username(&self) -> Option<String> {
        Self::env_var(self.mqtt.username_env.as_ref())
    }

    pub fn mqtt_password(&self) -> Option<String> {
        Self::env_var(self.mqtt.password_env.as_ref())
    }

    /// Broker credentials; the device registers with its identity as both
    /// username and password unless the environment says otherwise
    pub fn credentials(&self) -> (String, String) {
        let identity = &self.device.identity;
        (
            self.mqtt_username().unwrap_or_else(|| identity.clone()),
            self.mqtt_password().unwrap_or_else(|| identity.clone()),
        )
    }
}

/// Broker endpoint extracted from a URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Split a broker URL into host, port and TLS flag
pub fn parse_broker_url(broker_url: &str) -> Result<BrokerEndpoint, ConfigError> {
    let url =
        Url::parse(broker_url).map_err(|_| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(ConfigError::InvalidBrokerUrl(broker_url.to_string())),
    };
    let host = url
        .host_str()
        .ok_or_else(|| ConfigError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint { host, port, tls })
}
