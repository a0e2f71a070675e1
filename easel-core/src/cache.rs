use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{OnceCell, OwnedMutexGuard};
use tracing::info;

use crate::{Device, LoadError, ModelId, PipelineLoader, PipelineOptions, TextToImage};

/// A loaded pipeline plus the lock that serializes inference on it.
pub struct CachedPipeline {
    model: ModelId,
    device: Device,
    pipeline: Arc<tokio::sync::Mutex<Box<dyn TextToImage>>>,
}

impl CachedPipeline {
    pub fn model(&self) -> &ModelId {
        &self.model
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Grants exclusive use of the pipeline. The guard owns its `Arc`, so it
    /// can move into a blocking task and outlive a cache invalidation.
    pub async fn acquire(&self) -> OwnedMutexGuard<Box<dyn TextToImage>> {
        Arc::clone(&self.pipeline).lock_owned().await
    }
}

type Entry = Arc<OnceCell<Arc<CachedPipeline>>>;

/// Keyed pipeline cache with single-flight loading.
///
/// Concurrent `get_or_load` calls for one model share a single load; a failed
/// load is never cached, so the next caller retries. Invalidation drops the
/// map entries while any in-flight generation keeps its pipeline alive
/// through its own `Arc`.
pub struct ModelCache {
    loader: Arc<dyn PipelineLoader>,
    device: Device,
    entries: Mutex<HashMap<ModelId, Entry>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn PipelineLoader>, device: Device) -> Self {
        Self {
            loader,
            device,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Returns the cached pipeline for `model`, loading it on first use.
    pub async fn get_or_load(&self, model: &ModelId) -> Result<Arc<CachedPipeline>, LoadError> {
        let entry = {
            let mut entries = self.lock_entries();
            entries.entry(model.clone()).or_default().clone()
        };
        let pipeline = entry
            .get_or_try_init(|| async {
                let started = Instant::now();
                let options = PipelineOptions::for_device(self.device);
                let pipeline = self.loader.load(model, options).await?;
                info!(
                    model = %model,
                    device = %self.device,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "pipeline loaded"
                );
                Ok(Arc::new(CachedPipeline {
                    model: model.clone(),
                    device: self.device,
                    pipeline: Arc::new(tokio::sync::Mutex::new(pipeline)),
                }))
            })
            .await?;
        Ok(Arc::clone(pipeline))
    }

    /// Drops every cached pipeline and reports how many were loaded.
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.lock_entries();
        let dropped = entries
            .values()
            .filter(|entry| entry.initialized())
            .count();
        entries.clear();
        dropped
    }

    /// Number of fully loaded pipelines. Entries still loading do not count.
    pub fn len(&self) -> usize {
        self.lock_entries()
            .values()
            .filter(|entry| entry.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Held for map operations only, never across an await.
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<ModelId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
