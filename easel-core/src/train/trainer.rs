use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use crate::{TrainingError, TrainingJobId, TrainingSpec};

/// Receives progress while a trainer runs. Implementations must be cheap;
/// updates come from the job's async task.
pub trait ProgressSink: Send + Sync {
    fn update(&self, progress: u8, message: &str);
}

/// Everything a trainer needs to produce a model from a saved image set.
#[derive(Debug, Clone)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub spec: TrainingSpec,
    pub images_dir: PathBuf,
    pub model_dir: PathBuf,
}

#[async_trait]
pub trait Trainer: Send + Sync {
    async fn run(&self, job: &TrainingJob, progress: &dyn ProgressSink)
        -> Result<(), TrainingError>;
}

/// Runs an external fine-tune command, passing the job over argv.
pub struct CommandTrainer {
    program: PathBuf,
    base_args: Vec<String>,
}

impl CommandTrainer {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }
}

#[async_trait]
impl Trainer for CommandTrainer {
    async fn run(
        &self,
        job: &TrainingJob,
        progress: &dyn ProgressSink,
    ) -> Result<(), TrainingError> {
        progress.update(5, "starting trainer process");
        let mut command = Command::new(&self.program);
        command
            .args(&self.base_args)
            .arg("--identifier")
            .arg(&job.spec.identifier)
            .arg("--images-dir")
            .arg(&job.images_dir)
            .arg("--output-dir")
            .arg(&job.model_dir)
            .arg("--epochs")
            .arg(job.spec.epochs.to_string())
            .arg("--learning-rate")
            .arg(job.spec.learning_rate.to_string())
            .arg("--batch-size")
            .arg(job.spec.batch_size.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = command.spawn()?;
        progress.update(10, "trainer process running");
        let output = child.wait_with_output().await?;

        if output.status.success() {
            info!(
                training_id = %job.id,
                identifier = %job.spec.identifier,
                "trainer process finished"
            );
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                training_id = %job.id,
                status = %output.status,
                "trainer process failed"
            );
            Err(TrainingError::Trainer(format!(
                "trainer exited with {}: {}",
                output.status,
                tail(stderr.trim(), 500)
            )))
        }
    }
}

/// Last `max_chars` characters, respecting UTF-8 boundaries.
fn tail(text: &str, max_chars: usize) -> &str {
    let start = text
        .char_indices()
        .rev()
        .nth(max_chars.saturating_sub(1))
        .map_or(0, |(idx, _)| idx);
    &text[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(u8, String)>>);

    impl ProgressSink for RecordingSink {
        fn update(&self, progress: u8, message: &str) {
            self.0.lock().unwrap().push((progress, message.to_string()));
        }
    }

    fn job() -> TrainingJob {
        TrainingJob {
            id: TrainingJobId::generate(),
            spec: TrainingSpec {
                identifier: "test-model".to_string(),
                ..TrainingSpec::default()
            },
            images_dir: PathBuf::from("images"),
            model_dir: PathBuf::from("model"),
        }
    }

    #[tokio::test]
    async fn successful_command_reports_progress() {
        let trainer = CommandTrainer::new("true", Vec::new());
        let sink = RecordingSink::default();

        trainer.run(&job(), &sink).await.unwrap();

        let updates = sink.0.lock().unwrap();
        assert_eq!(updates[0].0, 5);
        assert_eq!(updates[1].0, 10);
    }

    #[tokio::test]
    async fn failing_command_surfaces_trainer_error() {
        let trainer = CommandTrainer::new("false", Vec::new());
        let sink = RecordingSink::default();

        let err = trainer.run(&job(), &sink).await.unwrap_err();
        assert!(matches!(err, TrainingError::Trainer(_)));
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let trainer = CommandTrainer::new("/does/not/exist/train.sh", Vec::new());
        let sink = RecordingSink::default();

        let err = trainer.run(&job(), &sink).await.unwrap_err();
        assert!(matches!(err, TrainingError::Io(_)));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 2), "lo");
        assert_eq!(tail("hi", 10), "hi");
        assert_eq!(tail("héllo", 4), "éllo");
    }
}
