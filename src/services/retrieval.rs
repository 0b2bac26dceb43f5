use crate::app_state::AppState;
use crate::db::DbError;
use crate::models::job::{mime_for_extension, ImageRecord, JobStatus};
use crate::services::secret::{verify_secret, SecretError};
use crate::services::storage::StorageError;

/// Number of ids returned by the random listing.
pub const RANDOM_SAMPLE_SIZE: usize = 5;

/// A processed image ready to be served.
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

/// Load a record and enforce its access secret.
pub async fn authorized_record(
    state: &AppState,
    id: &str,
    secret: Option<&str>,
) -> Result<ImageRecord, RetrievalError> {
    let record = state
        .images
        .get(id)
        .await?
        .ok_or_else(|| RetrievalError::NotFound(id.to_string()))?;

    if record.protected {
        let stored = record
            .access_secret_hash
            .as_deref()
            .ok_or(SecretError::MalformedHash)?;
        let presented = secret.ok_or(RetrievalError::Forbidden)?;
        if !verify_secret(&record.id, presented, stored)? {
            tracing::warn!(image_id = %record.id, "Rejected access with wrong secret");
            return Err(RetrievalError::Forbidden);
        }
    }

    Ok(record)
}

/// Fetch the processed bytes of a completed job.
pub async fn fetch_processed(
    state: &AppState,
    id: &str,
    secret: Option<&str>,
) -> Result<ProcessedImage, RetrievalError> {
    let record = authorized_record(state, id, secret).await?;

    if record.status != JobStatus::Completed {
        return Err(RetrievalError::NotReady {
            id: record.id,
            status: record.status,
        });
    }

    let bytes = match state.store.get_processed(&record.id, record.format).await {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(key)) => {
            // Completed record without its file: report it as missing.
            tracing::error!(image_id = %record.id, key = %key, "Processed file missing for completed record");
            return Err(RetrievalError::NotFound(record.id));
        }
        Err(e) => return Err(e.into()),
    };

    Ok(ProcessedImage {
        bytes,
        mime_type: mime_for_extension(record.format.extension()),
    })
}

/// Ids of `RANDOM_SAMPLE_SIZE` random public, completed images.
pub async fn sample_public(state: &AppState) -> Result<Vec<String>, RetrievalError> {
    let ids = state
        .images
        .sample_public_completed(RANDOM_SAMPLE_SIZE)
        .await?;

    if ids.len() < RANDOM_SAMPLE_SIZE {
        return Err(RetrievalError::NotEnoughImages {
            wanted: RANDOM_SAMPLE_SIZE,
            available: ids.len(),
        });
    }
    Ok(ids)
}

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Image {id} is not ready (status {status})")]
    NotReady { id: String, status: JobStatus },

    #[error("Access secret missing or wrong")]
    Forbidden,

    #[error("Not enough public images: wanted {wanted}, found {available}")]
    NotEnoughImages { wanted: usize, available: usize },

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
