//! Configuration types and loading

use std::path::{Path, PathBuf};

use eyre::Result;
use serde::{Deserialize, Serialize};

use crate::pinner::PinnerConfig;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pinner behavior (backoff, timeout, restart)
    pub pinner: PinnerConfig,

    /// Directory holding the durable pin store
    pub store_path: PathBuf,
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tagpin")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pinner: PinnerConfig::default(),
            store_path: default_store_path(),
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    ///
    /// Fallback chain: explicit path, `./tagpin.yml`, then
    /// `<config dir>/tagpin/tagpin.yml`.
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            return Self::load_from_file(config_path);
        }

        let default_paths = [
            Some(PathBuf::from("tagpin.yml")),
            dirs::config_dir().map(|p| p.join("tagpin").join("tagpin.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                match Self::load_from_file(path) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", path.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
