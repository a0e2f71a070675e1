use std::sync::Arc;

use easel_core::{GenerationService, ModelCache, TrainingService};

/// Shared handles behind every request.
#[derive(Clone)]
pub struct AppState {
    pub generation: Arc<GenerationService>,
    pub training: Arc<TrainingService>,
    pub cache: Arc<ModelCache>,
}
