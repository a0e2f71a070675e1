use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{TrainingError, TrainingJobId, TrainingSpec, TrainingStatus};

pub const MIN_TRAINING_IMAGES: usize = 10;
pub const MAX_TRAINING_IMAGES: usize = 20;
pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_TOTAL_BYTES: u64 = 100 * 1024 * 1024;
pub const MAX_USER_STORAGE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// An image as it arrived in the upload, not yet on disk.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct StoredFile {
    pub filename: String,
    pub original_filename: String,
    pub size_bytes: u64,
}

/// Persisted alongside a training set as `metadata.json`; carries the job
/// status so finished jobs are still answerable after a restart.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TrainingMetadata {
    pub status: TrainingStatus,
    pub created_at: DateTime<Utc>,
    pub num_images: usize,
    pub total_size_bytes: u64,
    pub images: Vec<StoredFile>,
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

#[derive(Debug, Clone)]
pub struct UserDirs {
    pub root: PathBuf,
    pub training_images: PathBuf,
    pub models: PathBuf,
    pub logs: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SavedImages {
    pub images_dir: PathBuf,
    pub files: Vec<StoredFile>,
    pub total_bytes: u64,
}

/// Filesystem layout for training data:
///
/// ```text
/// <root>/users/<user_id>/
///     training_images/<identifier>/{images/, metadata.json}
///     models/<identifier>/
///     logs/
/// ```
#[derive(Debug, Clone)]
pub struct TrainingStore {
    root: PathBuf,
    user_quota: u64,
}

impl TrainingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            user_quota: MAX_USER_STORAGE_BYTES,
        }
    }

    pub fn with_user_quota(mut self, quota: u64) -> Self {
        self.user_quota = quota;
        self
    }

    pub fn user_dirs(&self, user_id: &str) -> UserDirs {
        let root = self.root.join("users").join(user_id);
        UserDirs {
            training_images: root.join("training_images"),
            models: root.join("models"),
            logs: root.join("logs"),
            root,
        }
    }

    pub fn training_dir(&self, user_id: &str, identifier: &str) -> PathBuf {
        self.user_dirs(user_id).training_images.join(identifier)
    }

    pub fn images_dir(&self, user_id: &str, identifier: &str) -> PathBuf {
        self.training_dir(user_id, identifier).join("images")
    }

    pub fn model_dir(&self, user_id: &str, identifier: &str) -> PathBuf {
        self.user_dirs(user_id).models.join(identifier)
    }

    pub fn metadata_path(&self, user_id: &str, identifier: &str) -> PathBuf {
        self.training_dir(user_id, identifier).join("metadata.json")
    }

    /// Validates and persists an upload, replacing any previous set for the
    /// same (user, identifier). Blocking; call off the async runtime.
    pub fn save_training_images(
        &self,
        spec: &TrainingSpec,
        images: &[UploadedImage],
    ) -> Result<SavedImages, TrainingError> {
        if !(MIN_TRAINING_IMAGES..=MAX_TRAINING_IMAGES).contains(&images.len()) {
            return Err(TrainingError::InvalidUpload(format!(
                "expected {MIN_TRAINING_IMAGES} to {MAX_TRAINING_IMAGES} images, got {}",
                images.len()
            )));
        }

        let mut total_bytes = 0u64;
        let mut extensions = Vec::with_capacity(images.len());
        for image in images {
            if image.bytes.is_empty() {
                return Err(TrainingError::InvalidUpload(format!(
                    "image {} is empty",
                    image.filename
                )));
            }
            let size = image.bytes.len() as u64;
            if size > MAX_IMAGE_BYTES {
                return Err(TrainingError::InvalidUpload(format!(
                    "image {} exceeds {} bytes",
                    image.filename, MAX_IMAGE_BYTES
                )));
            }
            let extension = extension_of(&image.filename)
                .filter(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
                .ok_or_else(|| {
                    TrainingError::InvalidUpload(format!(
                        "image {} must be one of: {}",
                        image.filename,
                        ALLOWED_EXTENSIONS.join(", ")
                    ))
                })?;
            total_bytes += size;
            extensions.push(extension);
        }
        if total_bytes > MAX_TOTAL_BYTES {
            return Err(TrainingError::StorageLimit(format!(
                "upload totals {total_bytes} bytes, limit is {MAX_TOTAL_BYTES}"
            )));
        }
        let used = self.user_usage_bytes(&spec.user_id)?;
        if used + total_bytes > self.user_quota {
            return Err(TrainingError::StorageLimit(format!(
                "user {} would exceed the {} byte storage quota",
                spec.user_id, self.user_quota
            )));
        }

        let training_dir = self.training_dir(&spec.user_id, &spec.identifier);
        if training_dir.exists() {
            std::fs::remove_dir_all(&training_dir)?;
        }
        let images_dir = self.images_dir(&spec.user_id, &spec.identifier);
        std::fs::create_dir_all(&images_dir)?;
        let dirs = self.user_dirs(&spec.user_id);
        std::fs::create_dir_all(&dirs.models)?;
        std::fs::create_dir_all(&dirs.logs)?;

        let mut files = Vec::with_capacity(images.len());
        for (idx, (image, extension)) in images.iter().zip(&extensions).enumerate() {
            let filename = format!("{}_{idx:03}.{extension}", spec.identifier);
            std::fs::write(images_dir.join(&filename), &image.bytes)?;
            files.push(StoredFile {
                filename,
                original_filename: image.filename.clone(),
                size_bytes: image.bytes.len() as u64,
            });
        }

        info!(
            user_id = %spec.user_id,
            identifier = %spec.identifier,
            count = files.len(),
            total_bytes,
            "training images saved"
        );
        Ok(SavedImages {
            images_dir,
            files,
            total_bytes,
        })
    }

    pub fn write_metadata(
        &self,
        user_id: &str,
        identifier: &str,
        metadata: &TrainingMetadata,
    ) -> Result<(), TrainingError> {
        let path = self.metadata_path(user_id, identifier);
        std::fs::write(path, serde_json::to_vec_pretty(metadata)?)?;
        Ok(())
    }

    pub fn read_metadata(
        &self,
        user_id: &str,
        identifier: &str,
    ) -> Result<Option<TrainingMetadata>, TrainingError> {
        let path = self.metadata_path(user_id, identifier);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Folds the latest status into the persisted metadata.
    pub fn update_status(&self, status: &TrainingStatus) -> Result<(), TrainingError> {
        match self.read_metadata(&status.user_id, &status.model_identifier)? {
            Some(mut metadata) => {
                metadata.status = status.clone();
                self.write_metadata(&status.user_id, &status.model_identifier, &metadata)
            }
            None => {
                warn!(
                    training_id = %status.training_id,
                    "metadata missing while updating job status"
                );
                Ok(())
            }
        }
    }

    /// Looks a job up by id across all persisted metadata. Used for jobs
    /// that predate the current process.
    pub fn find_status(
        &self,
        training_id: &TrainingJobId,
    ) -> Result<Option<TrainingStatus>, TrainingError> {
        let users = read_dir_sorted(&self.root.join("users"))?;
        for user_dir in users.iter().filter(|path| path.is_dir()) {
            for training_dir in read_dir_sorted(&user_dir.join("training_images"))? {
                let path = training_dir.join("metadata.json");
                let bytes = match std::fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(err.into()),
                };
                let metadata: TrainingMetadata = serde_json::from_slice(&bytes)?;
                if metadata.status.training_id == *training_id {
                    return Ok(Some(metadata.status));
                }
            }
        }
        Ok(None)
    }

    pub fn user_usage_bytes(&self, user_id: &str) -> Result<u64, TrainingError> {
        Ok(dir_size(&self.user_dirs(user_id).root)?)
    }
}

fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename)
        .extension()?
        .to_str()
        .map(str::to_ascii_lowercase)
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut total = 0;
    for entry in entries {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

fn read_dir_sorted(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    let mut paths = entries
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec() -> TrainingSpec {
        TrainingSpec {
            user_id: "alice".to_string(),
            identifier: "pet-corgi".to_string(),
            ..TrainingSpec::default()
        }
    }

    fn images(count: usize, bytes_each: usize) -> Vec<UploadedImage> {
        (0..count)
            .map(|i| UploadedImage {
                filename: format!("Holiday Photo {i}.PNG"),
                bytes: vec![0xAB; bytes_each],
            })
            .collect()
    }

    fn metadata_for(saved: &SavedImages, status: TrainingStatus) -> TrainingMetadata {
        TrainingMetadata {
            status,
            created_at: Utc::now(),
            num_images: saved.files.len(),
            total_size_bytes: saved.total_bytes,
            images: saved.files.clone(),
            epochs: 100,
            learning_rate: 5e-6,
            batch_size: 1,
        }
    }

    #[test]
    fn saved_files_are_renamed_and_counted() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        let saved = store.save_training_images(&spec(), &images(10, 100)).unwrap();
        assert_eq!(saved.files.len(), 10);
        assert_eq!(saved.total_bytes, 1000);
        assert_eq!(saved.files[0].filename, "pet-corgi_000.png");
        assert_eq!(saved.files[9].filename, "pet-corgi_009.png");
        assert_eq!(saved.files[3].original_filename, "Holiday Photo 3.PNG");
        assert!(saved.images_dir.join("pet-corgi_000.png").is_file());
        assert!(store.user_dirs("alice").models.is_dir());
        assert!(store.user_dirs("alice").logs.is_dir());
    }

    #[test]
    fn image_count_is_bounded() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        let err = store
            .save_training_images(&spec(), &images(9, 10))
            .unwrap_err();
        assert!(matches!(err, TrainingError::InvalidUpload(_)));

        let err = store
            .save_training_images(&spec(), &images(21, 10))
            .unwrap_err();
        assert!(matches!(err, TrainingError::InvalidUpload(_)));
    }

    #[test]
    fn oversized_image_is_rejected() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        let mut set = images(10, 10);
        set[4].bytes = vec![0; MAX_IMAGE_BYTES as usize + 1];
        let err = store.save_training_images(&spec(), &set).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidUpload(_)));
    }

    #[test]
    fn oversized_set_is_rejected() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        // 11 images at the individual limit blow the set limit.
        let set = images(11, MAX_IMAGE_BYTES as usize);
        let err = store.save_training_images(&spec(), &set).unwrap_err();
        assert!(matches!(err, TrainingError::StorageLimit(_)));
    }

    #[test]
    fn user_quota_is_enforced() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path()).with_user_quota(10_000);

        let err = store
            .save_training_images(&spec(), &images(10, 2_000))
            .unwrap_err();
        assert!(matches!(err, TrainingError::StorageLimit(_)));

        assert!(store
            .save_training_images(&spec(), &images(10, 100))
            .is_ok());
    }

    #[test]
    fn resubmission_replaces_the_previous_set() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        store.save_training_images(&spec(), &images(12, 50)).unwrap();
        let saved = store.save_training_images(&spec(), &images(10, 50)).unwrap();

        let on_disk = read_dir_sorted(&saved.images_dir).unwrap();
        assert_eq!(on_disk.len(), 10);
    }

    #[test]
    fn extension_allowlist_is_enforced() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        let mut set = images(10, 10);
        set[0].filename = "payload.exe".to_string();
        let err = store.save_training_images(&spec(), &set).unwrap_err();
        assert!(matches!(err, TrainingError::InvalidUpload(_)));

        let mut set = images(10, 10);
        set[0].filename = "no-extension".to_string();
        assert!(store.save_training_images(&spec(), &set).is_err());

        let mut set = images(10, 10);
        set[0].filename = "shot.WebP".to_string();
        assert!(store.save_training_images(&spec(), &set).is_ok());
    }

    #[test]
    fn metadata_round_trips_and_updates() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());
        let spec = spec();
        let saved = store.save_training_images(&spec, &images(10, 10)).unwrap();

        let id = TrainingJobId::generate();
        let status = TrainingStatus::pending(id.clone(), &spec);
        store
            .write_metadata(&spec.user_id, &spec.identifier, &metadata_for(&saved, status))
            .unwrap();

        let loaded = store
            .read_metadata(&spec.user_id, &spec.identifier)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status.training_id, id);
        assert_eq!(loaded.num_images, 10);

        let mut updated = loaded.status.clone();
        updated.state = crate::JobState::Completed;
        updated.progress = 100;
        store.update_status(&updated).unwrap();

        let found = store.find_status(&id).unwrap().unwrap();
        assert_eq!(found.state, crate::JobState::Completed);
        assert_eq!(found.progress, 100);
    }

    #[test]
    fn lookups_miss_cleanly() {
        let dir = tempdir().unwrap();
        let store = TrainingStore::new(dir.path());

        assert!(store.read_metadata("nobody", "nothing").unwrap().is_none());
        assert!(store
            .find_status(&TrainingJobId::from("train_missing"))
            .unwrap()
            .is_none());
        assert_eq!(store.user_usage_bytes("nobody").unwrap(), 0);
    }
}
