use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{Device, ModelId};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Top-level service configuration, usually loaded from `easel.toml`.
///
/// Every section and field has a default, so an empty file (or no file at
/// all) yields a runnable CPU configuration.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct EaselConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: UserModelMap,
    #[serde(default)]
    pub generation: GenerationDefaults,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub training: TrainingConfig,
}

impl EaselConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device: Device,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            device: Device::default(),
        }
    }
}

/// Maps user ids to their personalized model, falling back to a shared
/// default for everyone else.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct UserModelMap {
    #[serde(default = "default_model")]
    pub default: String,
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

impl UserModelMap {
    pub fn resolve(&self, user_id: &str) -> ModelId {
        match self.users.get(user_id) {
            Some(model) => ModelId::from(model.as_str()),
            None => ModelId::from(self.default.as_str()),
        }
    }
}

impl Default for UserModelMap {
    fn default() -> Self {
        Self {
            default: default_model(),
            users: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default = "default_guidance")]
    pub guidance: f64,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            steps: default_steps(),
            guidance: default_guidance(),
            width: default_dimension(),
            height: default_dimension(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Root for per-user training data, models and logs.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Where generated images are archived; `None` disables archiving.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            output_dir: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct TrainingConfig {
    /// External fine-tune command; `None` disables the training endpoints.
    #[serde(default)]
    pub command: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_model() -> String {
    "models/default".to_string()
}

fn default_steps() -> u32 {
    30
}

fn default_guidance() -> f64 {
    7.5
}

fn default_dimension() -> u32 {
    512
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
