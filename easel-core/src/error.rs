use std::time::Duration;

use thiserror::Error;

use crate::ModelId;

/// Failure to turn a model id into a runnable pipeline.
///
/// `NotFound` is terminal for the id as configured; the other variants may
/// clear up on a later request. None of them leaves a cache entry behind.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("model `{0}` not found")]
    NotFound(ModelId),
    #[error("failed to read model `{model}`")]
    Io {
        model: ModelId,
        #[source]
        source: std::io::Error,
    },
    #[error("registry fetch failed for `{model}`: {reason}")]
    Registry { model: ModelId, reason: String },
    #[error("invalid pipeline manifest for `{model}`: {reason}")]
    Manifest { model: ModelId, reason: String },
    #[error("model `{model}` uses unsupported pipeline family `{family}`")]
    Unsupported { model: ModelId, family: String },
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error(transparent)]
    ModelUnavailable(#[from] LoadError),
    /// The pipeline failed mid-inference; it stays cached and usable.
    #[error("generation failed on `{model}`")]
    Inference {
        model: ModelId,
        #[source]
        source: anyhow::Error,
    },
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid training request: {0}")]
    InvalidSpec(String),
    #[error("invalid upload: {0}")]
    InvalidUpload(String),
    #[error("storage limit exceeded: {0}")]
    StorageLimit(String),
    #[error("training job `{0}` not found")]
    JobNotFound(String),
    #[error("a training job for `{identifier}` is already running")]
    AlreadyRunning { identifier: String },
    #[error("no training backend is configured")]
    Unconfigured,
    #[error("trainer failed: {0}")]
    Trainer(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
