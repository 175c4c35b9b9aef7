//! Layered configuration loading for the controller daemon.
//!
//! Precedence, lowest to highest:
//! 1. Defaults (`Config::default()`)
//! 2. Config file (`~/.config/xbatctld/config.toml`, or a path passed to
//!    [`ConfigLoader::with_file`])
//! 3. Environment variables, prefixed `XBATCTLD_`, nested fields separated
//!    by `__` (e.g. `XBATCTLD_SCHEDULER__REFRESH_TIMER_SECONDS=45`).

pub mod models;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde_valid::Validate;
use std::path::{Path, PathBuf};

pub use models::{
    BuildMode, Config, DocumentStoreConfig, HostBridgeConfig, RpcConfig, SchedulerConfig,
    TimeSeriesConfig,
};

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = "xbatctld";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "XBATCTLD";

/// Environment variable separator for nested configuration fields.
const ENV_SEPARATOR: &str = "__";

/// Builder-style configuration loader.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    custom_file: Option<PathBuf>,
    skip_default_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use this file instead of the default config-directory location.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip the default config-file lookup (tests; env/CLI-only runs).
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    /// Skip environment variable overrides.
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load and validate the configuration from all enabled sources.
    pub fn load(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::builder();

        let defaults = Config::default();
        let defaults_map = config_to_map(&defaults)?;
        builder = builder.add_source(config::Config::try_from(&defaults_map)?);

        if !self.skip_default_file {
            if let Some(config_path) = self.find_config_file() {
                tracing::debug!(path = %config_path.display(), "loading config file");
                builder = builder.add_source(
                    File::from(config_path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            }
        }

        if let Some(ref custom_path) = self.custom_file {
            tracing::info!(path = %custom_path.display(), "loading custom config file");
            builder = builder.add_source(
                File::from(custom_path.as_ref())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let built = builder.build().context("failed to build configuration")?;
        let config: Config = built
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("configuration validation failed: {e}"))?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        let local_config = PathBuf::from(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Some(local_config);
        }

        None
    }

    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

fn config_to_map(config: &Config) -> Result<serde_json::Value, ConfigError> {
    serde_json::to_value(config).map_err(|e| ConfigError::Foreign(Box::new(e)))
}

/// Write a default configuration file at the standard location. Errors if
/// one already exists.
pub fn init_config_file() -> Result<PathBuf> {
    let config_dir =
        ConfigLoader::default_config_dir().context("could not determine config directory")?;
    std::fs::create_dir_all(&config_dir).context("failed to create config directory")?;

    let config_path = config_dir.join(CONFIG_FILE_NAME);
    if config_path.exists() {
        anyhow::bail!("config file already exists at: {}", config_path.display());
    }

    let toml_content =
        toml::to_string_pretty(&Config::default()).context("failed to serialize default config")?;
    std::fs::write(&config_path, toml_content).context("failed to write config file")?;

    Ok(config_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn defaults_load_cleanly() {
        let config = ConfigLoader::new()
            .skip_default_file()
            .skip_env()
            .load()
            .expect("default config should validate");

        assert_eq!(config.scheduler.watch_min_iterations, 3);
        assert_eq!(config.scheduler.feature_constraint, "xbat");
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[scheduler]
refresh_timer_seconds = 45
job_state_interval_seconds = 30
watch_min_iterations = 3
queue_timeout_seconds = 5
job_eviction_days = 7
feature_constraint = "xbat"
"#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_file(&path)
            .skip_env()
            .load()
            .unwrap();
        assert_eq!(config.scheduler.refresh_timer_seconds, 45);
    }

    #[test]
    fn env_overrides_file() {
        env::set_var("XBATCTLD_SCHEDULER__REFRESH_TIMER_SECONDS", "99");

        let config = ConfigLoader::new().skip_default_file().load().unwrap();
        assert_eq!(config.scheduler.refresh_timer_seconds, 99);

        env::remove_var("XBATCTLD_SCHEDULER__REFRESH_TIMER_SECONDS");
    }
}
