//! Fine-tune job intake, bookkeeping and execution.
//!
//! A submitted job validates its spec, persists the uploaded images, then
//! runs the configured [`Trainer`] on a background task. Live jobs are
//! tracked in memory; terminal states are folded back into the on-disk
//! metadata so they survive a restart.

mod job;
mod storage;
mod trainer;

pub use job::{JobState, TrainingJobId, TrainingSpec, TrainingStatus};
pub use storage::{
    SavedImages, StoredFile, TrainingMetadata, TrainingStore, UploadedImage, UserDirs,
    MAX_IMAGE_BYTES, MAX_TOTAL_BYTES, MAX_TRAINING_IMAGES, MAX_USER_STORAGE_BYTES,
    MIN_TRAINING_IMAGES,
};
pub use trainer::{CommandTrainer, ProgressSink, Trainer, TrainingJob};

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use crate::TrainingError;

type JobMap = Arc<RwLock<HashMap<TrainingJobId, TrainingStatus>>>;

/// Returned by a successful submission.
#[derive(Serialize, Debug, Clone)]
pub struct TrainingReceipt {
    pub training_id: TrainingJobId,
    pub images_saved: usize,
    pub estimated_minutes: u32,
}

pub struct TrainingService {
    store: TrainingStore,
    trainer: Option<Arc<dyn Trainer>>,
    jobs: JobMap,
}

impl TrainingService {
    /// With no trainer configured, submissions are rejected but status
    /// lookups for persisted jobs still work.
    pub fn new(store: TrainingStore, trainer: Option<Arc<dyn Trainer>>) -> Self {
        Self {
            store,
            trainer,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Validates, stores the upload and kicks off training in the
    /// background. Returns as soon as the job is queued.
    pub async fn submit(
        &self,
        spec: TrainingSpec,
        images: Vec<UploadedImage>,
    ) -> Result<TrainingReceipt, TrainingError> {
        spec.validate()?;
        let trainer = self.trainer.clone().ok_or(TrainingError::Unconfigured)?;
        // Claim the (user, identifier) pair before the first await point, so
        // a concurrent duplicate cannot slip past the scan while the upload
        // is being written out.
        let (training_id, status) = self.reserve(&spec)?;

        let saved = match self.save_images(&spec, images).await {
            Ok(saved) => saved,
            Err(err) => {
                self.write_jobs().remove(&training_id);
                return Err(err);
            }
        };

        let metadata = TrainingMetadata {
            status,
            created_at: Utc::now(),
            num_images: saved.files.len(),
            total_size_bytes: saved.total_bytes,
            images: saved.files.clone(),
            epochs: spec.epochs,
            learning_rate: spec.learning_rate,
            batch_size: spec.batch_size,
        };
        if let Err(err) = self
            .store
            .write_metadata(&spec.user_id, &spec.identifier, &metadata)
        {
            self.write_jobs().remove(&training_id);
            return Err(err.into());
        }

        let job = TrainingJob {
            id: training_id.clone(),
            model_dir: self.store.model_dir(&spec.user_id, &spec.identifier),
            images_dir: saved.images_dir,
            spec,
        };
        let receipt = TrainingReceipt {
            training_id,
            images_saved: saved.files.len(),
            estimated_minutes: job.spec.epochs / 2,
        };
        info!(
            training_id = %job.id,
            user_id = %job.spec.user_id,
            identifier = %job.spec.identifier,
            images = receipt.images_saved,
            "training job accepted"
        );
        tokio::spawn(run_job(
            trainer,
            job,
            Arc::clone(&self.jobs),
            self.store.clone(),
        ));
        Ok(receipt)
    }

    /// Job status by id, checking live jobs first and falling back to
    /// metadata persisted by earlier runs of the process.
    pub fn status(&self, training_id: &str) -> Result<TrainingStatus, TrainingError> {
        let id = TrainingJobId::from(training_id);
        if let Some(status) = self.read_jobs().get(&id).cloned() {
            return Ok(status);
        }
        self.store
            .find_status(&id)?
            .ok_or_else(|| TrainingError::JobNotFound(training_id.to_string()))
    }

    /// Scans for a live duplicate and registers the new job as pending in
    /// one critical section. The caller must remove the entry again if a
    /// later submission step fails.
    fn reserve(
        &self,
        spec: &TrainingSpec,
    ) -> Result<(TrainingJobId, TrainingStatus), TrainingError> {
        let mut jobs = self.write_jobs();
        let running = jobs.values().any(|status| {
            !status.state.is_terminal()
                && status.user_id == spec.user_id
                && status.model_identifier == spec.identifier
        });
        if running {
            return Err(TrainingError::AlreadyRunning {
                identifier: spec.identifier.clone(),
            });
        }
        let training_id = TrainingJobId::generate();
        let status = TrainingStatus::pending(training_id.clone(), spec);
        jobs.insert(training_id.clone(), status.clone());
        Ok((training_id, status))
    }

    async fn save_images(
        &self,
        spec: &TrainingSpec,
        images: Vec<UploadedImage>,
    ) -> Result<SavedImages, TrainingError> {
        let store = self.store.clone();
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || store.save_training_images(&spec, &images))
            .await
            .map_err(std::io::Error::other)?
    }

    fn read_jobs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TrainingJobId, TrainingStatus>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<TrainingJobId, TrainingStatus>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_job(trainer: Arc<dyn Trainer>, job: TrainingJob, jobs: JobMap, store: TrainingStore) {
    transition(&jobs, &store, &job.id, |status| {
        status.state = JobState::Running;
        status.progress = 5;
        status.message = "training started".to_string();
        status.started_at = Some(Utc::now());
    });

    let sink = MapSink {
        jobs: Arc::clone(&jobs),
        id: job.id.clone(),
    };
    match trainer.run(&job, &sink).await {
        Ok(()) => {
            transition(&jobs, &store, &job.id, |status| {
                status.state = JobState::Completed;
                status.progress = 100;
                status.message = "training completed".to_string();
                status.completed_at = Some(Utc::now());
            });
            info!(training_id = %job.id, "training job completed");
        }
        Err(err) => {
            transition(&jobs, &store, &job.id, |status| {
                status.state = JobState::Failed;
                status.message = "training failed".to_string();
                status.error = Some(err.to_string());
                status.completed_at = Some(Utc::now());
            });
            error!(training_id = %job.id, error = %err, "training job failed");
        }
    }
}

/// Applies a state change in memory, then mirrors it to disk.
fn transition(
    jobs: &JobMap,
    store: &TrainingStore,
    id: &TrainingJobId,
    apply: impl FnOnce(&mut TrainingStatus),
) {
    let snapshot = {
        let mut jobs = jobs.write().unwrap_or_else(PoisonError::into_inner);
        let Some(status) = jobs.get_mut(id) else {
            return;
        };
        apply(status);
        status.clone()
    };
    if let Err(err) = store.update_status(&snapshot) {
        error!(training_id = %id, error = %err, "failed to persist job status");
    }
}

/// Forwards trainer progress into the live job map. Ignores updates once
/// the job left the running state.
struct MapSink {
    jobs: JobMap,
    id: TrainingJobId,
}

impl ProgressSink for MapSink {
    fn update(&self, progress: u8, message: &str) {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(status) = jobs.get_mut(&self.id) {
            if status.state == JobState::Running {
                status.progress = progress.min(100);
                status.message = message.to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct StubTrainer {
        delay: Duration,
        fail: bool,
        runs: AtomicUsize,
    }

    impl StubTrainer {
        fn arc(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                delay: Duration::from_millis(5),
                fail,
                runs: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Trainer for StubTrainer {
        async fn run(
            &self,
            _job: &TrainingJob,
            progress: &dyn ProgressSink,
        ) -> Result<(), TrainingError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            progress.update(50, "halfway");
            tokio::time::sleep(self.delay).await;
            if self.fail {
                Err(TrainingError::Trainer("loss diverged".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn spec(identifier: &str) -> TrainingSpec {
        TrainingSpec {
            user_id: "alice".to_string(),
            identifier: identifier.to_string(),
            ..TrainingSpec::default()
        }
    }

    fn images(count: usize) -> Vec<UploadedImage> {
        (0..count)
            .map(|i| UploadedImage {
                filename: format!("photo_{i}.jpg"),
                bytes: vec![1, 2, 3],
            })
            .collect()
    }

    async fn wait_terminal(service: &TrainingService, id: &TrainingJobId) -> TrainingStatus {
        for _ in 0..200 {
            let status = service.status(id.as_str()).unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let dir = tempdir().unwrap();
        let trainer = StubTrainer::arc(false);
        let service = TrainingService::new(TrainingStore::new(dir.path()), Some(trainer.clone()));

        let receipt = service.submit(spec("corgi"), images(10)).await.unwrap();
        assert!(receipt.training_id.as_str().starts_with("train_"));
        assert_eq!(receipt.images_saved, 10);
        assert_eq!(receipt.estimated_minutes, 50);

        let done = wait_terminal(&service, &receipt.training_id).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.started_at.is_some());
        assert!(done.completed_at.is_some());
        assert!(done.error.is_none());
        assert_eq!(trainer.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_trainer_reports_failed_with_error() {
        let dir = tempdir().unwrap();
        let service =
            TrainingService::new(TrainingStore::new(dir.path()), Some(StubTrainer::arc(true)));

        let receipt = service.submit(spec("corgi"), images(10)).await.unwrap();
        let done = wait_terminal(&service, &receipt.training_id).await;

        assert_eq!(done.state, JobState::Failed);
        assert_eq!(done.error.as_deref(), Some("loss diverged"));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn submit_without_trainer_is_rejected() {
        let dir = tempdir().unwrap();
        let service = TrainingService::new(TrainingStore::new(dir.path()), None);

        let err = service.submit(spec("corgi"), images(10)).await.unwrap_err();
        assert!(matches!(err, TrainingError::Unconfigured));
    }

    #[tokio::test]
    async fn duplicate_identifier_while_running_is_rejected() {
        let dir = tempdir().unwrap();
        let trainer = Arc::new(StubTrainer {
            delay: Duration::from_millis(200),
            fail: false,
            runs: AtomicUsize::new(0),
        });
        let service = TrainingService::new(TrainingStore::new(dir.path()), Some(trainer));

        let receipt = service.submit(spec("corgi"), images(10)).await.unwrap();
        let err = service.submit(spec("corgi"), images(10)).await.unwrap_err();
        assert!(matches!(err, TrainingError::AlreadyRunning { .. }));

        // A different identifier for the same user is fine.
        service.submit(spec("cat"), images(10)).await.unwrap();

        wait_terminal(&service, &receipt.training_id).await;
        service.submit(spec("corgi"), images(10)).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_duplicate_submits_accept_exactly_one() {
        let dir = tempdir().unwrap();
        let trainer = Arc::new(StubTrainer {
            delay: Duration::from_millis(100),
            fail: false,
            runs: AtomicUsize::new(0),
        });
        let service = TrainingService::new(TrainingStore::new(dir.path()), Some(trainer.clone()));

        // Both submissions suspend while their images are written out; the
        // duplicate check must already have claimed the identifier by then.
        let (a, b) = tokio::join!(
            service.submit(spec("corgi"), images(10)),
            service.submit(spec("corgi"), images(10)),
        );
        let (receipt, rejection) = match (a, b) {
            (Ok(receipt), Err(err)) | (Err(err), Ok(receipt)) => (receipt, err),
            (a, b) => panic!("expected exactly one winner, got {a:?} and {b:?}"),
        };
        assert!(matches!(rejection, TrainingError::AlreadyRunning { .. }));

        let done = wait_terminal(&service, &receipt.training_id).await;
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(trainer.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let dir = tempdir().unwrap();
        let service = TrainingService::new(TrainingStore::new(dir.path()), None);

        let err = service.status("train_missing").unwrap_err();
        assert!(matches!(err, TrainingError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn finished_jobs_survive_restart() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());
        let service = TrainingService::new(store.clone(), Some(StubTrainer::arc(false)));

        let receipt = service.submit(spec("corgi"), images(10)).await.unwrap();
        wait_terminal(&service, &receipt.training_id).await;

        // A fresh service over the same store finds the job on disk.
        let restarted = TrainingService::new(store, None);
        let status = restarted.status(receipt.training_id.as_str()).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.progress, 100);
    }

    #[tokio::test]
    async fn invalid_spec_is_rejected_before_storage() {
        let dir = tempdir().unwrap();
        let service =
            TrainingService::new(TrainingStore::new(dir.path()), Some(StubTrainer::arc(false)));

        let err = service.submit(spec("x"), images(10)).await.unwrap_err();
        assert!(matches!(err, TrainingError::InvalidSpec(_)));
        assert!(!dir.path().join("users").exists());
    }

    #[tokio::test]
    async fn too_few_images_rejected() {
        let dir = tempdir().unwrap();
        let service =
            TrainingService::new(TrainingStore::new(dir.path()), Some(StubTrainer::arc(false)));

        let err = service.submit(spec("corgi"), images(3)).await.unwrap_err();
        assert!(matches!(err, TrainingError::InvalidUpload(_)));

        // The rejected attempt must not leave the identifier claimed.
        service.submit(spec("corgi"), images(10)).await.unwrap();
    }
}
