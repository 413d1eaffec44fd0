//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered with the
//! `config` crate, later sources overriding earlier ones:
//!
//! 1. `OrchestratorConfig::default()`
//! 2. `<config_dir>/reelflow.toml`
//! 3. `<config_dir>/reelflow.<environment>.toml`
//! 4. `REELFLOW_<SECTION>__<KEY>` environment variables

use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::OrchestratorConfig;
use crate::error::Result;

const BASE_FILE: &str = "reelflow.toml";
const ENV_PREFIX: &str = "REELFLOW";

pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> Result<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment.
    /// Useful in tests that should not touch process-wide variables.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            "Loading configuration for environment '{}' from directory: {}",
            environment,
            config_directory.display()
        );

        let config = Self::load_and_merge_config(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = environment,
            node_id = %config.resources.node_id,
            strategy = ?config.load_balancer.strategy,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// JSON rendering of the merged configuration for diagnostics
    pub fn debug_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// REELFLOW_ENV || APP_ENV || 'development'
    pub fn detect_environment() -> String {
        env::var("REELFLOW_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    fn default_config_directory() -> PathBuf {
        if let Ok(dir) = env::var("REELFLOW_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        PathBuf::from("config")
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> Result<OrchestratorConfig> {
        let base_path = config_directory.join(BASE_FILE);
        let env_path = config_directory.join(format!("reelflow.{environment}.toml"));

        debug!(
            base_exists = base_path.exists(),
            env_exists = env_path.exists(),
            "Resolving configuration layers"
        );

        let merged = Config::builder()
            .add_source(Config::try_from(&OrchestratorConfig::default())?)
            .add_source(File::from(base_path.as_path()).required(false))
            .add_source(File::from(env_path.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(merged.try_deserialize::<OrchestratorConfig>()?)
    }
}
