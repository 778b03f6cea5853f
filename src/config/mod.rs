use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::PreferredEngine;

/// vea application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root of engine installs, runtime dirs and geo data
    pub artifacts_dir: PathBuf,

    /// HTTP API bind address
    pub listen: String,

    /// Log filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Engine used when a proxy config does not pin one
    #[serde(default)]
    pub default_engine: PreferredEngine,

    /// Start the persisted proxy config when `serve` boots
    #[serde(default)]
    pub auto_start: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            artifacts_dir: data_dir.join("vea").join("artifacts"),
            listen: "127.0.0.1:19080".to_string(),
            log_level: default_log_level(),
            default_engine: PreferredEngine::Auto,
            auto_start: false,
        }
    }
}

impl AppConfig {
    /// Get the default config file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir =
            dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        Ok(config_dir.join("vea").join("config.yaml"))
    }

    /// Load configuration from the default location, writing defaults on first run
    pub fn load() -> Result<Self> {
        Self::load_or_init(&Self::default_path()?)
    }

    /// Load `path`, creating it with the defaults when it does not exist yet
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from(path);
        }
        let config = Self::default();
        config.save_to(path)?;
        Ok(config)
    }

    /// Load configuration from a file, falling back to defaults when it is missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_yaml::to_string(self)?;
        fs::write(path, contents)?;

        Ok(())
    }

    /// Merge command line arguments into config
    pub fn merge_cli(
        &mut self,
        artifacts_dir: Option<PathBuf>,
        listen: Option<String>,
        log_level: Option<String>,
    ) {
        if let Some(dir) = artifacts_dir {
            self.artifacts_dir = dir;
        }

        if let Some(addr) = listen {
            self.listen = addr;
        }

        if let Some(level) = log_level {
            self.log_level = level;
        }
    }

    /// JSON entity store
    pub fn state_path(&self) -> PathBuf {
        self.artifacts_dir.join("state.json")
    }
}
