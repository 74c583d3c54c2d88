//! Agent configuration types

use serde::Deserialize;
use std::path::PathBuf;

use crate::{ConfigError, ConfigResult};

fn default_buffer_size() -> u8 {
    17
}
fn default_checkpoint_frequency() -> u64 {
    1000
}
fn default_max_assets() -> usize {
    1024
}
fn default_json_version() -> u8 {
    2
}
fn default_port() -> u16 {
    5000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_device_xml() -> PathBuf {
    PathBuf::from("devices.xml")
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_adapter_port() -> u16 {
    7878
}
fn default_reconnect_interval_s() -> u64 {
    10
}

/// Top-level agent configuration
///
/// `buffer_size` is the exponent k; the observation buffer holds 2^k entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// MTConnect schema version, e.g. "2.0". Defaults to the highest
    /// supported version when absent from both config and descriptor.
    pub schema_version: Option<String>,

    /// Path to the device descriptor XML
    #[serde(default = "default_device_xml")]
    pub device_xml: PathBuf,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: u8,

    #[serde(default = "default_checkpoint_frequency")]
    pub checkpoint_frequency: u64,

    #[serde(default = "default_max_assets")]
    pub max_assets: usize,

    /// JSON printer format version (1 or 2)
    #[serde(default = "default_json_version")]
    pub json_version: u8,

    #[serde(default)]
    pub pretty: bool,

    /// Suppress the synthetic agent device
    #[serde(default)]
    pub disable_agent_device: bool,

    /// Back up the descriptor file with a timestamp suffix on model change
    #[serde(default)]
    pub version_device_xml_updates: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Adapter connect implies device availability
    #[serde(default)]
    pub auto_available: bool,

    /// Request realtime scheduling for the ingest threads
    #[serde(default)]
    pub real_time: bool,

    pub mqtt: Option<MqttConfig>,

    #[serde(default, rename = "adapter")]
    pub adapters: Vec<AdapterConfig>,

    #[serde(default, rename = "upstream")]
    pub upstreams: Vec<UpstreamConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            schema_version: None,
            device_xml: default_device_xml(),
            buffer_size: default_buffer_size(),
            checkpoint_frequency: default_checkpoint_frequency(),
            max_assets: default_max_assets(),
            json_version: default_json_version(),
            pretty: false,
            disable_agent_device: false,
            version_device_xml_updates: false,
            host: default_host(),
            port: default_port(),
            auto_available: false,
            real_time: false,
            mqtt: None,
            adapters: Vec::new(),
            upstreams: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.buffer_size == 0 || self.buffer_size > 28 {
            return Err(ConfigError::Invalid(format!(
                "buffer_size must be in 1..=28, got {}",
                self.buffer_size
            )));
        }
        if self.json_version != 1 && self.json_version != 2 {
            return Err(ConfigError::Invalid(format!(
                "json_version must be 1 or 2, got {}",
                self.json_version
            )));
        }
        if self.max_assets == 0 {
            return Err(ConfigError::Invalid("max_assets must be non-zero".into()));
        }
        if self.checkpoint_frequency == 0 {
            return Err(ConfigError::Invalid(
                "checkpoint_frequency must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// The advertised `host:port` of the REST surface, used to derive the
    /// agent device uuid.
    pub fn advertised_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Observation buffer capacity (2^buffer_size)
    pub fn buffer_capacity(&self) -> usize {
        1usize << self.buffer_size
    }
}

/// MQTT sink connection settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// A SHDR adapter to connect to
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    pub host: String,
    #[serde(default = "default_adapter_port")]
    pub port: u16,
    /// Device the adapter feeds; empty means the default device
    #[serde(default)]
    pub device: String,
    /// Per-adapter override of the agent-wide auto_available flag
    pub auto_available: Option<bool>,
    /// Seconds without input before the connection is considered dead
    pub legacy_timeout_s: Option<u64>,
    #[serde(default = "default_reconnect_interval_s")]
    pub reconnect_interval_s: u64,
}

impl AdapterConfig {
    /// Source identity used for connection_status routing ("host:port")
    pub fn identity(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An upstream MTConnect agent to relay from
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Base url of the upstream agent, e.g. "http://mill-7:5000"
    pub url: String,
    /// Restrict relaying to a single upstream device
    pub device: Option<String>,
    #[serde(default = "default_reconnect_interval_s")]
    pub reconnect_interval_s: u64,
    /// Observations fetched per sample request
    pub count: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AgentConfig::default();
        assert_eq!(config.buffer_size, 17);
        assert_eq!(config.buffer_capacity(), 131072);
        assert_eq!(config.checkpoint_frequency, 1000);
        assert_eq!(config.max_assets, 1024);
        assert_eq!(config.json_version, 2);
        assert_eq!(config.port, 5000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_buffer_size() {
        let mut config = AgentConfig::default();
        config.buffer_size = 0;
        assert!(config.validate().is_err());
        config.buffer_size = 29;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_json_version() {
        let mut config = AgentConfig::default();
        config.json_version = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_full_file() {
        let text = r#"
            schema_version = "2.0"
            device_xml = "samples/test_config.xml"
            buffer_size = 8
            port = 5001
            auto_available = true

            [mqtt]
            host = "broker.local"
            port = 8883
            tls = true
            username = "agent"
            password = "secret"

            [[adapter]]
            host = "127.0.0.1"
            port = 7878
            device = "LinuxCNC"

            [[upstream]]
            url = "http://upstream:5000"
        "#;
        let config: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.schema_version.as_deref(), Some("2.0"));
        assert_eq!(config.buffer_capacity(), 256);
        assert_eq!(config.adapters.len(), 1);
        assert_eq!(config.adapters[0].identity(), "127.0.0.1:7878");
        assert_eq!(config.upstreams.len(), 1);
        let mqtt = config.mqtt.unwrap();
        assert!(mqtt.tls);
        assert_eq!(mqtt.port, 8883);
    }
}
