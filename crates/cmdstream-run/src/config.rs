use std::path::{Path, PathBuf};
use std::time::Duration;

use cmdstream_runtime::PoolConfig;

use crate::app::Args;

type Result<T> = std::result::Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    YamlParseError(PathBuf, serde_yaml::Error),
}

/// `<config dir>/cmdstream/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("cmdstream").join("config.yaml"))
}

/// Load the pool configuration. An explicitly given file must exist; the
/// default location is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<PoolConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.is_file() => path,
            _ => {
                tracing::debug!("No config file found, using defaults");
                return Ok(PoolConfig::default());
            }
        },
    };

    tracing::debug!("Loading config from {}", path.display());
    let content =
        std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
    if content.trim().is_empty() {
        return Ok(PoolConfig::default());
    }

    serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlParseError(path, e))
}

/// Command-line flags win over the file
pub fn apply_overrides(mut config: PoolConfig, args: &Args) -> PoolConfig {
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = args.command_timeout {
        config.command_timeout = Some(Duration::from_secs(secs));
    }
    config
}
