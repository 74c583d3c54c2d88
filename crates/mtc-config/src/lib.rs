//! Configuration for the MTConnect agent.
//!
//! Two-tier loading: a TOML file provides the base settings, environment
//! variables (prefix `MTC_`) override individual fields at runtime.

pub mod loader;
pub mod types;

pub use loader::{apply_environment_overrides, find_config_file, load_config};
pub use types::{AdapterConfig, AgentConfig, MqttConfig, UpstreamConfig};

use thiserror::Error;

/// Errors raised while locating, parsing, or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
