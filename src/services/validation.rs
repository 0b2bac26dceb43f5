use garde::Validate;
use image::{DynamicImage, GenericImageView, ImageReader};
use std::io::Cursor;

use crate::models::job::{Dimensions, Filter, ImageFormat};
use crate::models::upload::{ResizeTarget, SourceDimensions, UploadRequest};

/// Upload size limit in bytes.
pub const MAX_UPLOAD_BYTES: usize = 1_000_000;

/// Declared content types accepted for uploads.
pub const ACCEPTED_CONTENT_TYPES: &[&str] = &["image/jpeg", "image/jpg", "image/png"];

/// An upload that passed every check.
#[derive(Debug, Clone)]
pub struct AdmittedUpload {
    pub image: DynamicImage,
    pub source_size: Dimensions,
    pub format: ImageFormat,
    pub filter: Option<Filter>,
    pub resize: Option<Dimensions>,
    pub secret: Option<String>,
}

/// Check an upload, in order:
/// content type, byte size, decodability, source dimensions, resize target,
/// filter count, target format, access secret.
///
/// Returns the first failing check. Pure: nothing is written.
pub fn validate_upload(request: &UploadRequest) -> Result<AdmittedUpload, ValidationError> {
    // ── Declared content type ────────────────────────────────────────
    let content_type = request.content_type.trim().to_ascii_lowercase();
    if !ACCEPTED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(ValidationError::UnsupportedContentType(
            request.content_type.clone(),
        ));
    }

    // ── Byte size ────────────────────────────────────────────────────
    if request.bytes.len() > MAX_UPLOAD_BYTES {
        return Err(ValidationError::TooLarge {
            size: request.bytes.len(),
            max: MAX_UPLOAD_BYTES,
        });
    }

    // ── Decodability (structural pass, then full decode) ─────────────
    let image = decode_verified(&request.bytes)?;

    // ── Source dimensions ────────────────────────────────────────────
    let (width, height) = image.dimensions();
    SourceDimensions { width, height }
        .validate()
        .map_err(|_| ValidationError::DimensionsOutOfRange { width, height })?;

    // ── Resize target ────────────────────────────────────────────────
    let resize = if request.apply_resize {
        let (Some(width), Some(height)) = (request.width, request.height) else {
            return Err(ValidationError::ResizeIncomplete);
        };
        let target = ResizeTarget { width, height };
        target
            .validate()
            .map_err(|_| ValidationError::ResizeOutOfRange { width, height })?;
        Some(Dimensions::from(target))
    } else {
        None
    };

    // ── Filter count ─────────────────────────────────────────────────
    let filters = request.requested_filters();
    if filters.len() > 1 {
        return Err(ValidationError::TooManyFilters(filters));
    }
    let filter = filters.first().copied();

    // ── Target format ────────────────────────────────────────────────
    let format = match request.format.as_deref().map(str::trim) {
        None | Some("") => return Err(ValidationError::MissingFormat),
        Some(ext) => ImageFormat::from_extension(ext)
            .ok_or_else(|| ValidationError::UnsupportedFormat(ext.to_string()))?,
    };

    // ── Access secret ────────────────────────────────────────────────
    let secret = if request.protected {
        match request.secret.as_deref() {
            Some(secret) if !secret.is_empty() => Some(secret.to_string()),
            _ => return Err(ValidationError::MissingSecret),
        }
    } else {
        None
    };

    Ok(AdmittedUpload {
        image,
        source_size: Dimensions::new(width, height),
        format,
        filter,
        resize,
        secret,
    })
}

/// Two-pass decode: read the header and check the container is JPEG or PNG,
/// then fully decode and check the pixels match the header.
fn decode_verified(bytes: &[u8]) -> Result<DynamicImage, ValidationError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
    match reader.format() {
        Some(image::ImageFormat::Jpeg) | Some(image::ImageFormat::Png) => {}
        Some(other) => {
            return Err(ValidationError::Undecodable(format!(
                "unsupported encoding {other:?}"
            )))
        }
        None => return Err(ValidationError::Undecodable("unknown encoding".to_string())),
    }
    let header = reader
        .into_dimensions()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;

    let image = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?
        .decode()
        .map_err(|e| ValidationError::Undecodable(e.to_string()))?;

    if image.dimensions() != header {
        return Err(ValidationError::Undecodable(format!(
            "header declares {}x{} but decoded {}x{}",
            header.0,
            header.1,
            image.width(),
            image.height()
        )));
    }
    Ok(image)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Only JPG, JPEG and PNG uploads are allowed (got {0:?})")]
    UnsupportedContentType(String),

    #[error("File size {size} exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid image file: {0}")]
    Undecodable(String),

    #[error("Image dimensions {width}x{height} must be between 32x32 and 2560x2560 pixels")]
    DimensionsOutOfRange { width: u32, height: u32 },

    #[error("Width and height must be given for resizing")]
    ResizeIncomplete,

    #[error("Resized dimensions {width}x{height} must be between 32x32 and 2560x2560 pixels")]
    ResizeOutOfRange { width: u32, height: u32 },

    #[error("Only one filter can be applied at a time (got {})", .0.len())]
    TooManyFilters(Vec<Filter>),

    #[error("Format must be specified")]
    MissingFormat,

    #[error("Only jpg, jpeg and png formats are allowed (got {0:?})")]
    UnsupportedFormat(String),

    #[error("Protected images need a non-empty secret")]
    MissingSecret,
}

impl ValidationError {
    /// Stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::UnsupportedContentType(_) => "content_type",
            ValidationError::TooLarge { .. } => "too_large",
            ValidationError::Undecodable(_) => "undecodable",
            ValidationError::DimensionsOutOfRange { .. } => "dimensions",
            ValidationError::ResizeIncomplete => "resize_incomplete",
            ValidationError::ResizeOutOfRange { .. } => "resize_range",
            ValidationError::TooManyFilters(_) => "too_many_filters",
            ValidationError::MissingFormat => "missing_format",
            ValidationError::UnsupportedFormat(_) => "format",
            ValidationError::MissingSecret => "missing_secret",
        }
    }
}
