use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::app_state::AppState;
use crate::db::{DbError, FinalizeResult};
use crate::models::job::{ImageRecord, JobOutcome, JobStatus};
use crate::services::queue::{QueueError, QueuedTask};
use crate::services::storage::{Namespace, StorageError};
use crate::services::transform::{self, TransformError, TransformSpec};

/// Where a task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Transforming,
    /// Processed file written and the record `COMPLETED`.
    Persisted,
    /// The record was marked `FAILED` (or was missing).
    Errored,
    /// The record was already `FAILED`; nothing was done.
    Skipped,
}

/// Summary of one task attempt.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub image_id: String,
    pub state: TaskState,
    pub error: Option<String>,
}

impl TaskReport {
    fn new(image_id: &str, state: TaskState, error: Option<String>) -> Self {
        Self {
            image_id: image_id.to_string(),
            state,
            error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Image record {0} not found")]
    RecordMissing(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Transform task panicked: {0}")]
    Join(String),
}

/// Run the transformation for one delivered task, exactly once.
///
/// Never returns an error: failures are recorded on the job record and
/// reported in the `TaskReport`.
pub async fn process_task(state: &AppState, task: &QueuedTask) -> TaskReport {
    let id = task.image_id.as_str();
    tracing::info!(
        image_id = %id,
        state = ?TaskState::Received,
        filter = ?task.filter,
        resize = ?task.resize(),
        "Processing image task"
    );

    let record = match state.images.get(id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            let err = WorkerError::RecordMissing(id.to_string());
            tracing::error!(image_id = %id, "Task references a missing record, dropping it");
            return TaskReport::new(id, TaskState::Errored, Some(err.to_string()));
        }
        Err(e) => return fail(state, id, WorkerError::Db(e)).await,
    };

    if record.status == JobStatus::Failed {
        tracing::info!(image_id = %id, "Record already failed, skipping redelivered task");
        return TaskReport::new(id, TaskState::Skipped, None);
    }

    match run_pipeline(state, &record, task).await {
        Ok(outcome) => commit(state, &record, outcome).await,
        Err(e) => fail(state, id, e).await,
    }
}

/// Load, transform and persist. Returns the outcome to commit; the record is
/// not touched here.
async fn run_pipeline(
    state: &AppState,
    record: &ImageRecord,
    task: &QueuedTask,
) -> Result<JobOutcome, WorkerError> {
    let original = state.store.get_original(&record.id, record.format).await?;

    let spec = TransformSpec {
        format: record.format,
        resize: task.resize(),
        filter: task.filter,
    };

    tracing::debug!(image_id = %record.id, state = ?TaskState::Transforming, "Transforming image");
    let start = Instant::now();
    let output = tokio::task::spawn_blocking(move || transform::process(&original, &spec))
        .await
        .map_err(|e| WorkerError::Join(e.to_string()))??;
    let elapsed = start.elapsed();
    metrics::histogram!("image_transform_seconds").record(elapsed.as_secs_f64());

    state
        .store
        .put_processed(&record.id, record.format, &output.bytes)
        .await?;

    tracing::info!(
        image_id = %record.id,
        width = output.width,
        height = output.height,
        bytes = output.bytes.len(),
        transform_ms = elapsed.as_millis() as u64,
        "Processed image stored"
    );

    Ok(JobOutcome::Completed {
        size: spec.resize,
    })
}

async fn commit(state: &AppState, record: &ImageRecord, outcome: JobOutcome) -> TaskReport {
    let id = record.id.as_str();
    match state.images.finalize(id, &outcome).await {
        Ok(FinalizeResult::Applied) => {
            metrics::counter!("image_jobs_completed_total").increment(1);
            tracing::info!(image_id = %id, "Image job completed");
            TaskReport::new(id, TaskState::Persisted, None)
        }
        Ok(FinalizeResult::AlreadyTerminal) => {
            tracing::warn!(image_id = %id, "Record failed while processing, leaving it failed");
            TaskReport::new(id, TaskState::Skipped, None)
        }
        Ok(FinalizeResult::Missing) => {
            // Expired mid-flight; do not leave the new file behind.
            tracing::warn!(image_id = %id, "Record deleted while processing, removing output");
            if let Err(e) = state.store.delete_in(Namespace::Processed, id, record.format).await {
                tracing::warn!(image_id = %id, error = %e, "Failed to remove orphaned output");
            }
            let err = WorkerError::RecordMissing(id.to_string());
            TaskReport::new(id, TaskState::Errored, Some(err.to_string()))
        }
        Err(e) => fail(state, id, WorkerError::Db(e)).await,
    }
}

async fn fail(state: &AppState, id: &str, error: WorkerError) -> TaskReport {
    let outcome = JobOutcome::Failed {
        reason: error.to_string(),
    };
    match state.images.finalize(id, &outcome).await {
        Ok(FinalizeResult::Applied) => {
            metrics::counter!("image_jobs_failed_total").increment(1);
            tracing::error!(image_id = %id, error = %error, "Image job failed");
        }
        Ok(FinalizeResult::AlreadyTerminal) => {
            // A redelivered task for a finished job; its result stands.
            tracing::warn!(image_id = %id, error = %error, "Task failed for a terminal record, keeping its state");
        }
        Ok(FinalizeResult::Missing) => {
            tracing::warn!(image_id = %id, error = %error, "Task failed for a deleted record");
        }
        Err(e) => {
            tracing::error!(image_id = %id, error = %error, finalize_error = %e, "Failed to record job failure");
        }
    }
    TaskReport::new(id, TaskState::Errored, Some(error.to_string()))
}

/// Process the next task from the queue.
/// Returns Ok(Some(report)) if a task was processed, Ok(None) if none was due.
pub async fn process_next(state: &AppState) -> Result<Option<TaskReport>, QueueError> {
    let task = match state.queue.dequeue().await? {
        Some(task) => task,
        None => return Ok(None),
    };

    let report = process_task(state, &task).await;

    // One attempt per delivery, whatever the outcome.
    state.queue.complete(&task).await?;
    Ok(Some(report))
}

/// A fixed number of worker loops sharing one queue.
pub struct WorkerPool {
    state: AppState,
}

impl WorkerPool {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run until `shutdown` flips to true. In-flight tasks finish first.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let concurrency = self.state.settings.worker_concurrency;
        tracing::info!(concurrency, "Worker pool starting");

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            let state = self.state.clone();
            let shutdown = shutdown.clone();
            workers.spawn(worker_loop(worker_id, state, shutdown));
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker loop panicked");
            }
        }
        tracing::info!("Worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, state: AppState, mut shutdown: watch::Receiver<bool>) {
    let poll_interval = state.settings.poll_interval;
    loop {
        if *shutdown.borrow() {
            break;
        }

        match process_next(&state).await {
            Ok(Some(report)) => {
                tracing::debug!(worker_id, image_id = %report.image_id, state = ?report.state, "Task finished");
                continue;
            }
            Ok(None) => {
                tracing::trace!(worker_id, "No tasks available, sleeping");
            }
            Err(e) => {
                tracing::error!(worker_id, error = %e, "Error reading task queue, will retry");
            }
        }

        tokio::select! {
            _ = sleep(poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }
    tracing::info!(worker_id, "Worker loop stopped");
}
