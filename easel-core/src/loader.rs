use std::path::Path;

use async_trait::async_trait;
use hf_hub::api::tokio::Api;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{LoadError, ModelId, PipelineOptions, ProceduralPipeline, TextToImage};

/// Manifest file every loadable pipeline directory carries.
pub const MANIFEST_FILE: &str = "pipeline.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineManifest {
    /// Pipeline family the loader dispatches on.
    pub family: String,
    /// Model this pipeline was fine-tuned from, if any.
    #[serde(default)]
    pub base_model: Option<String>,
    /// Token that activates the personalized subject (e.g. `sks person`).
    #[serde(default)]
    pub trigger_token: Option<String>,
    /// Gradient stops as `#rrggbb` strings; empty means the built-in palette.
    #[serde(default)]
    pub palette: Vec<String>,
}

/// Enum of supported pipeline families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineFamily {
    Procedural,
}

impl PipelineFamily {
    /// Detect the family from its manifest name.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("procedural") {
            Some(Self::Procedural)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait PipelineLoader: Send + Sync {
    async fn load(
        &self,
        model: &ModelId,
        options: PipelineOptions,
    ) -> Result<Box<dyn TextToImage>, LoadError>;
}

/// Loads pipelines from local directories, falling back to the registry for
/// ids that do not name an existing path.
pub struct DirLoader {
    api: Api,
}

impl DirLoader {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self { api: Api::new()? })
    }

    async fn manifest_text(&self, model: &ModelId) -> Result<String, LoadError> {
        let path = Path::new(model.as_str());
        if path.is_dir() {
            return tokio::fs::read_to_string(path.join(MANIFEST_FILE))
                .await
                .map_err(|source| match source.kind() {
                    std::io::ErrorKind::NotFound => LoadError::Manifest {
                        model: model.clone(),
                        reason: format!("{MANIFEST_FILE} missing"),
                    },
                    _ => LoadError::Io {
                        model: model.clone(),
                        source,
                    },
                });
        }
        if looks_like_path(model.as_str()) {
            return Err(LoadError::NotFound(model.clone()));
        }

        debug!(model = %model, "fetching manifest from registry");
        let file = self
            .api
            .model(model.as_str().to_string())
            .get(MANIFEST_FILE)
            .await
            .map_err(|e| {
                let reason = e.to_string();
                // The hub client does not type status codes; sniff 404s so a
                // missing repo surfaces as not-found rather than transient.
                if reason.contains("404") {
                    LoadError::NotFound(model.clone())
                } else {
                    LoadError::Registry {
                        model: model.clone(),
                        reason,
                    }
                }
            })?;
        tokio::fs::read_to_string(&file)
            .await
            .map_err(|source| LoadError::Io {
                model: model.clone(),
                source,
            })
    }
}

/// Ids with path syntax are never tried against the registry.
fn looks_like_path(id: &str) -> bool {
    id.starts_with('/')
        || id.starts_with("./")
        || id.starts_with("../")
        || id.ends_with('/')
        || !id.contains('/')
}

#[async_trait]
impl PipelineLoader for DirLoader {
    async fn load(
        &self,
        model: &ModelId,
        options: PipelineOptions,
    ) -> Result<Box<dyn TextToImage>, LoadError> {
        let text = self.manifest_text(model).await?;
        let manifest: PipelineManifest =
            serde_json::from_str(&text).map_err(|e| LoadError::Manifest {
                model: model.clone(),
                reason: e.to_string(),
            })?;
        match PipelineFamily::from_name(&manifest.family) {
            Some(PipelineFamily::Procedural) => {
                let pipeline = ProceduralPipeline::new(model, manifest, options)?;
                Ok(Box::new(pipeline))
            }
            None => Err(LoadError::Unsupported {
                model: model.clone(),
                family: manifest.family,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::Device;

    fn options() -> PipelineOptions {
        PipelineOptions::for_device(Device::Cpu)
    }

    fn loader() -> DirLoader {
        DirLoader::new().unwrap()
    }

    fn write_manifest(dir: &Path, json: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), json).unwrap();
    }

    async fn load_err(model: &ModelId) -> LoadError {
        match loader().load(model, options()).await {
            Ok(_) => panic!("load of {model} unexpectedly succeeded"),
            Err(err) => err,
        }
    }

    #[tokio::test]
    async fn loads_local_manifest() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), r#"{"family": "procedural"}"#);
        let model = ModelId::new(dir.path().to_string_lossy());
        loader().load(&model, options()).await.unwrap();
    }

    #[tokio::test]
    async fn missing_path_is_not_found() {
        let model = ModelId::from("./does-not-exist");
        let err = load_err(&model).await;
        assert!(matches!(err, LoadError::NotFound(_)));
    }

    #[tokio::test]
    async fn directory_without_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        let model = ModelId::new(dir.path().to_string_lossy());
        let err = load_err(&model).await;
        assert!(matches!(err, LoadError::Manifest { .. }));
    }

    #[tokio::test]
    async fn malformed_manifest_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), "{not json");
        let model = ModelId::new(dir.path().to_string_lossy());
        let err = load_err(&model).await;
        assert!(matches!(err, LoadError::Manifest { .. }));
    }

    #[tokio::test]
    async fn unknown_family_is_unsupported() {
        let dir = TempDir::new().unwrap();
        write_manifest(dir.path(), r#"{"family": "latent-diffusion"}"#);
        let model = ModelId::new(dir.path().to_string_lossy());
        let err = load_err(&model).await;
        match err {
            LoadError::Unsupported { family, .. } => assert_eq!(family, "latent-diffusion"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }

    #[test]
    fn family_detection_is_case_insensitive() {
        assert_eq!(
            PipelineFamily::from_name("Procedural"),
            Some(PipelineFamily::Procedural)
        );
        assert_eq!(PipelineFamily::from_name("flux"), None);
    }
}
