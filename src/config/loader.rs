//! # Configuration Loader
//!
//! Layers, lowest precedence first:
//!
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. `{dir}/pathway.toml`
//! 3. `{dir}/environments/{env}.toml`
//! 4. `PATHWAY__SECTION__KEY` environment variables
//!
//! Missing files are skipped. The environment name comes from `PATHWAY_ENV`,
//! then `APP_ENV`, and defaults to `development`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use crate::constants::ENV_PREFIX;
use crate::logging::get_environment;

const BASE_FILE: &str = "pathway";
const DEFAULT_DIRECTORY: &str = "config";

/// Loaded, validated and immutable configuration
#[derive(Debug)]
pub struct ConfigManager {
    config: Arc<EngineConfig>,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration from `./config` for the detected environment
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory for the detected environment
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory for an explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_DIRECTORY));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            frontend_url = %config.notifications.frontend_url,
            overdue_enabled = config.overdue.enabled,
            delays_enabled = config.delays.enabled,
            "Configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config: Arc::new(config),
            environment: environment.to_string(),
            config_directory,
        }))
    }

    fn build(directory: &Path, environment: &str) -> ConfigResult<EngineConfig> {
        let load_error = |e: config::ConfigError| ConfigurationError::load_error(environment, e);

        let defaults =
            config::Config::try_from(&EngineConfig::default()).map_err(load_error)?;
        let base = directory.join(BASE_FILE);
        let overrides = directory.join("environments").join(environment);

        config::Config::builder()
            .add_source(defaults)
            .add_source(config::File::from(base).required(false))
            .add_source(config::File::from(overrides).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)
    }

    /// Shared handle to the configuration
    pub fn config(&self) -> Arc<EngineConfig> {
        Arc::clone(&self.config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}
