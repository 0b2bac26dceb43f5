use base64::Engine;
use chrono::Utc;
use rand::RngCore;

use crate::app_state::AppState;
use crate::db::DbError;
use crate::models::job::{ImageRecord, JobOutcome, NewImageRecord};
use crate::models::upload::UploadRequest;
use crate::services::queue::{QueueError, QueuedTask};
use crate::services::secret::hash_secret;
use crate::services::storage::{object_key, Namespace, StorageError};
use crate::services::transform::{self, TransformError};
use crate::services::validation::{validate_upload, AdmittedUpload, ValidationError};

/// Random bytes behind each image id (8 URL-safe characters).
const ID_BYTES: usize = 6;

/// Attempts at drawing an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 5;

/// Generate an opaque URL-safe image id.
pub fn generate_image_id() -> String {
    let mut bytes = [0u8; ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Validate an upload, store its original, create its record and enqueue it.
///
/// On success the record is `PROCESSING`, the original is readable at its
/// canonical key, and a task is queued behind the admission delay.
pub async fn admit(state: &AppState, request: UploadRequest) -> Result<ImageRecord, AdmissionError> {
    let admitted = tokio::task::spawn_blocking(move || validate_upload(&request))
        .await
        .map_err(|e| AdmissionError::Join(e.to_string()))?
        .inspect_err(|e| {
            metrics::counter!("image_uploads_rejected_total", "reason" => e.reason()).increment(1);
        })?;

    let AdmittedUpload {
        image,
        format,
        filter,
        resize,
        secret,
        ..
    } = admitted;

    // The original is kept in the target format so every later read uses one
    // extension.
    let original = tokio::task::spawn_blocking(move || transform::encode(&image, format))
        .await
        .map_err(|e| AdmissionError::Join(e.to_string()))??;

    let record = insert_record(state, |id| {
        let now = Utc::now();
        NewImageRecord {
            id: id.to_string(),
            format,
            requested_filter: filter,
            requested_size: resize,
            access_secret_hash: secret.as_deref().map(|s| hash_secret(id, s)),
            created_at: now,
            expires_at: now + state.settings.retention,
        }
    })
    .await?;

    if let Err(e) = state.store.put_original(&record.id, format, &original).await {
        tracing::error!(image_id = %record.id, error = %e, "Failed to store original, removing record");
        if let Err(cleanup) = state.images.delete(&record.id).await {
            tracing::warn!(image_id = %record.id, error = %cleanup, "Failed to remove record");
        }
        return Err(e.into());
    }

    let task = QueuedTask::new(record.id.clone(), filter, resize);
    if let Err(e) = state.queue.enqueue(&task, state.settings.enqueue_delay).await {
        tracing::error!(image_id = %record.id, error = %e, "Failed to enqueue task");
        let outcome = JobOutcome::Failed {
            reason: format!("enqueue failed: {e}"),
        };
        if let Err(finalize) = state.images.finalize(&record.id, &outcome).await {
            tracing::error!(image_id = %record.id, error = %finalize, "Failed to mark record failed");
        }
        return Err(e.into());
    }

    metrics::counter!("image_jobs_submitted_total").increment(1);
    tracing::info!(
        image_id = %record.id,
        format = %record.format,
        filter = ?record.requested_filter,
        resize = ?record.requested_size,
        protected = record.protected,
        key = %object_key(Namespace::Originals, &record.id, format),
        "Image admitted, processing scheduled"
    );

    Ok(record)
}

/// Insert a record under a fresh id, drawing again on the rare collision.
async fn insert_record<F>(state: &AppState, build: F) -> Result<ImageRecord, AdmissionError>
where
    F: Fn(&str) -> NewImageRecord,
{
    for _ in 0..MAX_ID_ATTEMPTS {
        let id = generate_image_id();
        match state.images.insert(build(&id)).await {
            Ok(record) => return Ok(record),
            Err(DbError::DuplicateId(id)) => {
                tracing::warn!(image_id = %id, "Image id collision, drawing a new id");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(AdmissionError::IdExhausted)
}

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Failed to normalize original: {0}")]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Could not allocate an unused image id")]
    IdExhausted,

    #[error("Background task failed: {0}")]
    Join(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_url_safe() {
        for _ in 0..100 {
            let id = generate_image_id();
            assert_eq!(id.len(), 8);
            assert!(id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }
}
