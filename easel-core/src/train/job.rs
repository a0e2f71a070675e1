use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::TrainingError;

const IDENTIFIER_LEN: RangeInclusive<usize> = 3..=30;
const USER_ID_LEN: RangeInclusive<usize> = 1..=64;
const EPOCHS: RangeInclusive<u32> = 50..=500;
const LEARNING_RATE: RangeInclusive<f64> = 1e-7..=1e-4;
const BATCH_SIZE: RangeInclusive<u32> = 1..=4;

/// Opaque job handle, e.g. `train_3f9a2c1d`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct TrainingJobId(String);

impl TrainingJobId {
    pub fn generate() -> Self {
        Self(format!("train_{}", &Uuid::new_v4().simple().to_string()[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TrainingJobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// What to fine-tune and how hard.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TrainingSpec {
    pub user_id: String,
    pub identifier: String,
    pub epochs: u32,
    pub learning_rate: f64,
    pub batch_size: u32,
}

impl Default for TrainingSpec {
    fn default() -> Self {
        Self {
            user_id: crate::DEFAULT_USER_ID.to_string(),
            identifier: String::new(),
            epochs: 100,
            learning_rate: 5e-6,
            batch_size: 1,
        }
    }
}

impl TrainingSpec {
    pub fn validate(&self) -> Result<(), TrainingError> {
        check_name("user_id", &self.user_id, USER_ID_LEN)?;
        check_name("model_identifier", &self.identifier, IDENTIFIER_LEN)?;
        check_range("num_train_epochs", self.epochs, EPOCHS)?;
        check_range("learning_rate", self.learning_rate, LEARNING_RATE)?;
        check_range("train_batch_size", self.batch_size, BATCH_SIZE)?;
        Ok(())
    }
}

/// Both fields end up as path components, so the charset is strict.
fn check_name(field: &str, value: &str, len: RangeInclusive<usize>) -> Result<(), TrainingError> {
    if !len.contains(&value.len()) {
        return Err(TrainingError::InvalidSpec(format!(
            "{field} must be {} to {} characters",
            len.start(),
            len.end()
        )));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TrainingError::InvalidSpec(format!(
            "{field} may only contain letters, digits, underscores and hyphens"
        )));
    }
    Ok(())
}

fn check_range<T: PartialOrd + Copy + fmt::Display>(
    field: &str,
    value: T,
    range: RangeInclusive<T>,
) -> Result<(), TrainingError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(TrainingError::InvalidSpec(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        )))
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Point-in-time view of a job, both served over HTTP and persisted next to
/// the training images.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TrainingStatus {
    pub training_id: TrainingJobId,
    #[serde(rename = "status")]
    pub state: JobState,
    pub progress: u8,
    pub message: String,
    pub model_identifier: String,
    pub user_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TrainingStatus {
    pub fn pending(training_id: TrainingJobId, spec: &TrainingSpec) -> Self {
        Self {
            training_id,
            state: JobState::Pending,
            progress: 0,
            message: "queued".to_string(),
            model_identifier: spec.identifier.clone(),
            user_id: spec.user_id.clone(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}
