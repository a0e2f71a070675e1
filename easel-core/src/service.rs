use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use image::DynamicImage;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::{
    EaselConfig, GenerateError, GenerationDefaults, GenerationParams, GenerationRequest,
    GenerationResult, ModelCache, UserModelMap,
};

const STEPS: RangeInclusive<u32> = 1..=150;
const GUIDANCE: RangeInclusive<f64> = 1.0..=20.0;
const DIMENSION: RangeInclusive<u32> = 256..=1024;

/// Turns [`GenerationRequest`]s into images.
///
/// Resolves the caller's model through the user map, pulls the pipeline from
/// the shared cache and runs inference on the blocking pool under a
/// deadline. Inference on one pipeline is serialized; distinct models run in
/// parallel.
pub struct GenerationService {
    cache: Arc<ModelCache>,
    models: UserModelMap,
    defaults: GenerationDefaults,
    timeout: Duration,
    output_dir: Option<PathBuf>,
}

impl GenerationService {
    pub fn new(cache: Arc<ModelCache>, config: &EaselConfig) -> Self {
        Self {
            cache,
            models: config.models.clone(),
            defaults: config.generation.clone(),
            timeout: Duration::from_secs(config.generation.timeout_secs),
            output_dir: config.storage.output_dir.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerateError> {
        let params = self.resolve(request)?;
        let model = self.models.resolve(&request.user_id);
        debug!(model = %model, user_id = %request.user_id, "generation requested");

        // The reported generation time covers a cold model load too, so the
        // clock starts before the cache lookup.
        let started = Instant::now();
        let entry = self.cache.get_or_load(&model).await?;
        let run = async {
            let guard = entry.acquire().await;
            let params = params.clone();
            tokio::task::spawn_blocking(move || guard.generate(&params)).await
        };
        let rgb = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(Ok(rgb))) => rgb,
            Ok(Ok(Err(source))) => {
                return Err(GenerateError::Inference { model, source });
            }
            Ok(Err(join)) => {
                return Err(GenerateError::Inference {
                    model,
                    source: anyhow::anyhow!("inference task aborted: {join}"),
                });
            }
            Err(_) => {
                warn!(model = %model, timeout = ?self.timeout, "generation timed out");
                return Err(GenerateError::Timeout(self.timeout));
            }
        };

        let result = GenerationResult {
            image: DynamicImage::ImageRgb8(rgb),
            model,
            elapsed: started.elapsed(),
            seed: params.seed,
        };
        self.archive(&request.user_id, &result.image).await;
        info!(
            model = %result.model,
            seed = result.seed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "image generated"
        );
        Ok(result)
    }

    /// Fills defaults and bounds-checks the request.
    fn resolve(&self, request: &GenerationRequest) -> Result<GenerationParams, GenerateError> {
        let prompt = request.prompt.trim();
        if prompt.is_empty() {
            return Err(GenerateError::Validation(
                "prompt must not be empty".to_string(),
            ));
        }
        Ok(GenerationParams {
            prompt: prompt.to_string(),
            steps: check(
                "num_inference_steps",
                request.steps.unwrap_or(self.defaults.steps),
                STEPS,
            )?,
            guidance: check(
                "guidance_scale",
                request.guidance.unwrap_or(self.defaults.guidance),
                GUIDANCE,
            )?,
            width: check("width", request.width.unwrap_or(self.defaults.width), DIMENSION)?,
            height: check(
                "height",
                request.height.unwrap_or(self.defaults.height),
                DIMENSION,
            )?,
            seed: request.seed.unwrap_or_else(|| rand::rng().random()),
        })
    }

    /// Best-effort copy of the result into the output directory. Encoding
    /// and the writes happen on the blocking pool.
    async fn archive(&self, user_id: &str, image: &DynamicImage) {
        let Some(dir) = &self.output_dir else {
            return;
        };
        let user: String = user_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        let path = dir.join(format!("{user}_{}.png", Utc::now().format("%Y%m%d_%H%M%S%3f")));
        let dir = dir.clone();
        let image = image.clone();
        let saved = tokio::task::spawn_blocking(move || -> anyhow::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            image.save(&path)?;
            Ok(path)
        })
        .await
        .map_err(anyhow::Error::from)
        .and_then(|saved| saved);
        match saved {
            Ok(path) => debug!(path = %path.display(), "archived generated image"),
            Err(error) => warn!(%error, "failed to archive generated image"),
        }
    }
}

fn check<T: PartialOrd + Copy + Display>(
    name: &str,
    value: T,
    range: RangeInclusive<T>,
) -> Result<T, GenerateError> {
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(GenerateError::Validation(format!(
            "{name} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}
