//! Configuration file support for timefiles
//!
//! Reads from .timefiles/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration structure
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Rest advisor settings
    #[serde(default)]
    pub advisor: AdvisorConfig,
}

/// Storage-related configuration
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct StorageConfig {
    /// Database path override. When unset the CLI walks up the directory
    /// tree looking for a .timefiles folder, like git finds .git.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Rest advisor configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AdvisorConfig {
    /// Whether switch and subtask-end triggers record rest suggestions
    /// Default: true
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load config from .timefiles/config.toml
    /// Returns default config if file doesn't exist
    pub fn load() -> Self {
        if let Some(path) = Self::find_config_path() {
            if let Ok(contents) = std::fs::read_to_string(&path) {
                if let Ok(config) = toml::from_str(&contents) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Find config.toml by walking up directory tree
    fn find_config_path() -> Option<PathBuf> {
        let current_dir = std::env::current_dir().ok()?;
        let mut dir = current_dir.as_path();

        loop {
            let config_path = dir.join(".timefiles").join("config.toml");
            if config_path.exists() {
                return Some(config_path);
            }

            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
        None
    }
}
