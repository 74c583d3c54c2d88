//! Configuration file loading with environment overrides
//!
//! Loading order:
//! 1. TOML file (base settings)
//! 2. Environment variables prefixed `MTC_` (runtime overrides)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::AgentConfig;
use crate::{ConfigError, ConfigResult};

const CONFIG_FILE_NAME: &str = "agent.toml";

/// Find the agent configuration file
///
/// Search order:
/// 1. `MTC_CONFIG_PATH` environment variable
/// 2. `./agent.toml`
/// 3. `../agent.toml`
pub fn find_config_file() -> ConfigResult<PathBuf> {
    if let Ok(env_path) = env::var("MTC_CONFIG_PATH") {
        let path = PathBuf::from(env_path);
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::FileNotFound(format!(
            "config file named by MTC_CONFIG_PATH does not exist: {}",
            path.display()
        )));
    }

    let mut search_paths = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        search_paths.push(cwd.join(CONFIG_FILE_NAME));
        if let Some(parent) = cwd.parent() {
            search_paths.push(parent.join(CONFIG_FILE_NAME));
        }
    }

    for path in &search_paths {
        if path.exists() {
            return Ok(path.clone());
        }
    }

    let searched = search_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    Err(ConfigError::FileNotFound(format!(
        "'{CONFIG_FILE_NAME}' not found in:\n{searched}\nSet MTC_CONFIG_PATH to use another location."
    )))
}

/// Load configuration from a TOML file, apply env overrides, and validate.
///
/// When `config_path` is `None` the file is located via [`find_config_file`];
/// if no file exists anywhere, built-in defaults are used (the agent can run
/// with nothing but a descriptor file next to it).
pub fn load_config(config_path: Option<&Path>) -> ConfigResult<AgentConfig> {
    let mut config = match config_path {
        Some(path) => parse_file(path)?,
        None => match find_config_file() {
            Ok(path) => parse_file(&path)?,
            Err(ConfigError::FileNotFound(_)) => {
                debug!("no configuration file found, using defaults");
                AgentConfig::default()
            }
            Err(e) => return Err(e),
        },
    };

    apply_environment_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn parse_file(path: &Path) -> ConfigResult<AgentConfig> {
    let content = fs::read_to_string(path)?;
    let config = toml::from_str(&content)?;
    debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Apply environment variable overrides to configuration
///
/// Supported variables:
/// - `MTC_HOST`, `MTC_PORT`
/// - `MTC_SCHEMA_VERSION`
/// - `MTC_DEVICE_XML`
/// - `MTC_BUFFER_SIZE`, `MTC_CHECKPOINT_FREQUENCY`, `MTC_MAX_ASSETS`
/// - `MTC_JSON_VERSION`, `MTC_PRETTY`
/// - `MTC_MQTT_HOST`, `MTC_MQTT_PORT`
pub fn apply_environment_overrides(config: &mut AgentConfig) {
    if let Ok(value) = env::var("MTC_HOST") {
        config.host = value;
    }
    if let Ok(value) = env::var("MTC_PORT") {
        if let Ok(port) = value.parse::<u16>() {
            config.port = port;
        }
    }
    if let Ok(value) = env::var("MTC_SCHEMA_VERSION") {
        config.schema_version = Some(value);
    }
    if let Ok(value) = env::var("MTC_DEVICE_XML") {
        config.device_xml = PathBuf::from(value);
    }
    if let Ok(value) = env::var("MTC_BUFFER_SIZE") {
        if let Ok(k) = value.parse::<u8>() {
            config.buffer_size = k;
        }
    }
    if let Ok(value) = env::var("MTC_CHECKPOINT_FREQUENCY") {
        if let Ok(freq) = value.parse::<u64>() {
            config.checkpoint_frequency = freq;
        }
    }
    if let Ok(value) = env::var("MTC_MAX_ASSETS") {
        if let Ok(max) = value.parse::<usize>() {
            config.max_assets = max;
        }
    }
    if let Ok(value) = env::var("MTC_JSON_VERSION") {
        if let Ok(v) = value.parse::<u8>() {
            config.json_version = v;
        }
    }
    if let Ok(value) = env::var("MTC_PRETTY") {
        config.pretty = value == "1" || value.eq_ignore_ascii_case("true");
    }
    if let Ok(value) = env::var("MTC_MQTT_HOST") {
        if let Some(mqtt) = config.mqtt.as_mut() {
            mqtt.host = value;
        }
    }
    if let Ok(value) = env::var("MTC_MQTT_PORT") {
        if let (Some(mqtt), Ok(port)) = (config.mqtt.as_mut(), value.parse::<u16>()) {
            mqtt.port = port;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn find_config_file_env_var() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("custom.toml");
        File::create(&config_path).unwrap();

        env::set_var("MTC_CONFIG_PATH", config_path.to_str().unwrap());
        let result = find_config_file();
        env::remove_var("MTC_CONFIG_PATH");

        assert_eq!(result.unwrap(), config_path);
    }

    #[test]
    fn load_minimal_config() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "port = 5005").unwrap();
        writeln!(file, "buffer_size = 8").unwrap();

        let config = load_config(Some(&config_path)).unwrap();
        assert_eq!(config.port, 5005);
        assert_eq!(config.buffer_size, 8);
        // unspecified fields keep defaults
        assert_eq!(config.max_assets, 1024);
    }

    #[test]
    fn environment_overrides_file() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "port = 5005").unwrap();

        env::set_var("MTC_PORT", "6000");
        env::set_var("MTC_PRETTY", "true");
        let config = load_config(Some(&config_path)).unwrap();
        env::remove_var("MTC_PORT");
        env::remove_var("MTC_PRETTY");

        assert_eq!(config.port, 6000);
        assert!(config.pretty);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let _env_lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let config_path = dir.path().join(CONFIG_FILE_NAME);

        let mut file = File::create(&config_path).unwrap();
        writeln!(file, "json_version = 7").unwrap();

        assert!(load_config(Some(&config_path)).is_err());
    }
}
