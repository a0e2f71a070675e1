pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod loader;
pub mod procedural;
pub mod service;
pub mod train;

pub use cache::*;
pub use config::*;
pub use device::*;
pub use error::*;
pub use loader::*;
pub use procedural::*;
pub use service::*;
pub use train::*;

use std::fmt;
use std::time::Duration;

use image::{DynamicImage, RgbImage};
use serde::{Deserialize, Serialize};

/// User id a request falls back to when none is given.
pub const DEFAULT_USER_ID: &str = "default";

/// Opaque name of a generative pipeline: a local directory or a registry
/// reference such as `org/repo`. This is the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ModelId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    /// Selects the model through the user table; never an auth identity.
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(rename = "num_inference_steps")]
    pub steps: Option<u32>,
    #[serde(rename = "guidance_scale")]
    pub guidance: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub seed: Option<u64>,
}

fn default_user_id() -> String {
    DEFAULT_USER_ID.to_string()
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            user_id: default_user_id(),
            steps: None,
            guidance: None,
            width: None,
            height: None,
            seed: None,
        }
    }
}

/// Validated parameters handed to a pipeline. The seed is always resolved
/// here; pipelines draw no randomness of their own.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub steps: u32,
    pub guidance: f64,
    pub width: u32,
    pub height: u32,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    pub model: ModelId,
    pub elapsed: Duration,
    /// The seed that produced the image, whether the caller supplied it or
    /// the service drew one.
    pub seed: u64,
}

pub trait TextToImage: Send + Sync {
    fn generate(&self, params: &GenerationParams) -> anyhow::Result<RgbImage>;
}
