//! Configuration for the ledger binary

use serde::Deserialize;
use thiserror::Error;

use std::fs;
use std::path::{Path, PathBuf};

/// Config file read when no explicit path is given
pub const DEFAULT_CONFIG_FILE: &str = "ledger.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub keystore: KeyStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KeyStoreConfig {
    #[serde(default = "default_keystore_path")]
    pub path: PathBuf,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            path: default_keystore_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("data/blockchain")
}

fn default_keystore_path() -> PathBuf {
    PathBuf::from("data/wallets.json")
}

impl Config {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.path must not be empty".into()));
        }
        if self.keystore.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("keystore.path must not be empty".into()));
        }
        Ok(self)
    }
}

/// Loads configuration
///
/// With an explicit `path` the file must exist. Without one,
/// [`DEFAULT_CONFIG_FILE`] is read if present, and defaults are used otherwise.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let (path, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    if !required && !path.exists() {
        return Config::default().validate();
    }

    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let config: Config =
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;

    config.validate()
}
