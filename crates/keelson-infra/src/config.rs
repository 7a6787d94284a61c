//! Engine configuration loader.
//!
//! Reads `config.toml` (by default from `~/.keelson/`) into [`EngineConfig`].
//! Every field has a default, so an empty or partial file is valid.

use std::path::{Path, PathBuf};

use keelson_types::config::{EngineConfig, LogFormat};

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable overriding `logging.format`.
pub const LOG_FORMAT_ENV: &str = "KEELSON_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// `~/.keelson`.
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(".keelson"))
        .ok_or(ConfigError::NoHomeDir)
}

/// `~/.keelson/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(default_data_dir()?.join(CONFIG_FILE_NAME))
}

/// Parse TOML text. `origin` only labels errors.
pub fn parse_config(content: &str, origin: &Path) -> Result<EngineConfig, ConfigError> {
    toml::from_str(content).map_err(|e| ConfigError::Parse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })
}

/// Load the configuration at `path`, failing if it is missing or invalid.
pub async fn load_config(path: &Path) -> Result<EngineConfig, ConfigError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
    parse_config(&content, path)
}

/// Load the configuration at `path`, then apply `KEELSON_LOG_FORMAT`.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: logs a warning and returns defaults.
pub async fn load_or_default(path: &Path) -> EngineConfig {
    let mut config = match load_config(path).await {
        Ok(config) => config,
        Err(ConfigError::Read { source, .. }) if source.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            EngineConfig::default()
        }
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            EngineConfig::default()
        }
    };
    apply_log_format_override(&mut config, std::env::var(LOG_FORMAT_ENV).ok().as_deref());
    config
}

/// Replace `logging.format` with `value` when it names a known format.
/// An unknown value is logged and ignored.
pub fn apply_log_format_override(config: &mut EngineConfig, value: Option<&str>) {
    let Some(value) = value.filter(|v| !v.trim().is_empty()) else {
        return;
    };
    match value.parse::<LogFormat>() {
        Ok(format) => config.logging.format = format,
        Err(err) => tracing::warn!("{LOG_FORMAT_ENV}: {err}, keeping {:?}", config.logging.format),
    }
}
