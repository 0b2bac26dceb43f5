use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::upload::{ImageStatusResponse, RandomImagesResponse, UploadRequest, UploadResponse};
use crate::services::admission::{self, AdmissionError};
use crate::services::retrieval::{self, RetrievalError};

/// Header carrying the access secret of a protected image.
pub const ACCESS_SECRET_HEADER: &str = "x-access-secret";

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A failed request: status code plus a JSON error body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    ApiError {
        status,
        message: message.into(),
    }
}

impl From<AdmissionError> for ApiError {
    fn from(e: AdmissionError) -> Self {
        let status = match &e {
            AdmissionError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => {
                tracing::error!(error = %e, "Upload admission failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, e.to_string())
    }
}

impl From<RetrievalError> for ApiError {
    fn from(e: RetrievalError) -> Self {
        let status = match &e {
            RetrievalError::NotFound(_) | RetrievalError::NotReady { .. } => StatusCode::NOT_FOUND,
            RetrievalError::Forbidden => StatusCode::FORBIDDEN,
            RetrievalError::NotEnoughImages { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RetrievalError::Secret(_) | RetrievalError::Db(_) | RetrievalError::Storage(_) => {
                tracing::error!(error = %e, "Image retrieval failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        api_error(status, e.to_string())
    }
}

/// POST /upload: Submit an image for transformation.
pub async fn upload_image(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), ApiError> {
    let request = read_upload(multipart).await?;
    let record = admission::admit(&state, request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadResponse {
            image_id: record.id,
            status: record.status,
            message: "Image accepted for processing".to_string(),
        }),
    ))
}

/// GET /images/{id}: Download the processed image.
pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let image = retrieval::fetch_processed(&state, &image_id, access_secret(&headers)).await?;
    Ok(([(header::CONTENT_TYPE, image.mime_type)], image.bytes).into_response())
}

/// GET /images/{id}/status: Check a job's state.
pub async fn get_image_status(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ImageStatusResponse>, ApiError> {
    let record = retrieval::authorized_record(&state, &image_id, access_secret(&headers)).await?;
    let size = record.size.or(record.requested_size);

    Ok(Json(ImageStatusResponse {
        image_id: record.id,
        status: record.status,
        format: record.format,
        filter: record.requested_filter,
        width: size.map(|d| d.width),
        height: size.map(|d| d.height),
        protected: record.protected,
        error: record.failure_reason,
    }))
}

/// GET /images/random: Ids of random public, completed images.
pub async fn random_images(
    State(state): State<AppState>,
) -> Result<Json<RandomImagesResponse>, ApiError> {
    let image_ids = retrieval::sample_public(&state).await?;
    Ok(Json(RandomImagesResponse { image_ids }))
}

fn access_secret(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(ACCESS_SECRET_HEADER)
        .and_then(|value| value.to_str().ok())
}

async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest, ApiError> {
    let mut request = UploadRequest::default();
    let mut has_file = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };

        if name == "file" {
            request.content_type = field.content_type().unwrap_or_default().to_string();
            request.bytes = field
                .bytes()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
                .to_vec();
            has_file = true;
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
        apply_field(&mut request, &name, value.trim())?;
    }

    if !has_file {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing file field"));
    }
    Ok(request)
}

fn apply_field(request: &mut UploadRequest, name: &str, value: &str) -> Result<(), ApiError> {
    match name {
        "format" => request.format = (!value.is_empty()).then(|| value.to_string()),
        "apply_resize" => request.apply_resize = parse_flag(value),
        "width" => request.width = parse_side(name, value)?,
        "height" => request.height = parse_side(name, value)?,
        "apply_grayscale" => request.apply_grayscale = parse_flag(value),
        "apply_color_inversion" => request.apply_color_inversion = parse_flag(value),
        "apply_sepia" => request.apply_sepia = parse_flag(value),
        "apply_blur" => request.apply_blur = parse_flag(value),
        "protected" => request.protected = parse_flag(value),
        "secret" => request.secret = (!value.is_empty()).then(|| value.to_string()),
        other => tracing::debug!(field = other, "Ignoring unknown upload field"),
    }
    Ok(())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

fn parse_side(name: &str, value: &str) -> Result<Option<u32>, ApiError> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<u32>()
        .map(Some)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("Invalid {name}: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::JobStatus;
    use crate::services::validation::ValidationError;

    #[test]
    fn test_flags_accept_form_spellings() {
        for value in ["true", "TRUE", "1", "on", "yes"] {
            assert!(parse_flag(value), "{value}");
        }
        for value in ["false", "0", "", "off", "nope"] {
            assert!(!parse_flag(value), "{value}");
        }
    }

    #[test]
    fn test_form_fields_fill_request() {
        let mut request = UploadRequest::default();
        apply_field(&mut request, "format", "png").unwrap();
        apply_field(&mut request, "apply_resize", "true").unwrap();
        apply_field(&mut request, "width", "64").unwrap();
        apply_field(&mut request, "height", "").unwrap();
        apply_field(&mut request, "apply_sepia", "on").unwrap();
        apply_field(&mut request, "unknown", "x").unwrap();

        assert_eq!(request.format.as_deref(), Some("png"));
        assert!(request.apply_resize);
        assert_eq!(request.width, Some(64));
        assert_eq!(request.height, None);
        assert!(request.apply_sepia);
    }

    #[test]
    fn test_non_numeric_side_is_bad_request() {
        let mut request = UploadRequest::default();
        let err = apply_field(&mut request, "width", "wide").unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_error_status_mapping() {
        let err = ApiError::from(AdmissionError::Validation(ValidationError::MissingFormat));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = ApiError::from(RetrievalError::Forbidden);
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = ApiError::from(RetrievalError::NotReady {
            id: "abc".to_string(),
            status: JobStatus::Processing,
        });
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let err = ApiError::from(RetrievalError::NotEnoughImages {
            wanted: 5,
            available: 2,
        });
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
