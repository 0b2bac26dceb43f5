use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::models::job::{Dimensions, Filter, ImageFormat, JobStatus};

/// Smallest accepted side, for both uploads and resize targets.
pub const MIN_SIDE: u32 = 32;
/// Largest accepted side, for both uploads and resize targets.
pub const MAX_SIDE: u32 = 2560;

/// An upload as received from the request layer, before validation.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    pub bytes: Vec<u8>,
    pub content_type: String,
    pub format: Option<String>,
    pub apply_resize: bool,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub apply_grayscale: bool,
    pub apply_color_inversion: bool,
    pub apply_sepia: bool,
    pub apply_blur: bool,
    pub protected: bool,
    pub secret: Option<String>,
}

impl UploadRequest {
    /// Filters whose flag is set, in declaration order.
    pub fn requested_filters(&self) -> Vec<Filter> {
        [
            (self.apply_grayscale, Filter::Grayscale),
            (self.apply_color_inversion, Filter::ColorInversion),
            (self.apply_sepia, Filter::Sepia),
            (self.apply_blur, Filter::Blur),
        ]
        .into_iter()
        .filter_map(|(set, filter)| set.then_some(filter))
        .collect()
    }
}

/// Requested resize target; both sides must fall inside the accepted range.
#[derive(Debug, Clone, Copy, Deserialize, Validate)]
pub struct ResizeTarget {
    #[garde(range(min = MIN_SIDE, max = MAX_SIDE))]
    pub width: u32,

    #[garde(range(min = MIN_SIDE, max = MAX_SIDE))]
    pub height: u32,
}

impl From<ResizeTarget> for Dimensions {
    fn from(target: ResizeTarget) -> Self {
        Dimensions::new(target.width, target.height)
    }
}

/// Decoded source dimensions; both sides must fall inside the accepted range.
#[derive(Debug, Clone, Copy, Validate)]
pub struct SourceDimensions {
    #[garde(range(min = MIN_SIDE, max = MAX_SIDE))]
    pub width: u32,

    #[garde(range(min = MIN_SIDE, max = MAX_SIDE))]
    pub height: u32,
}

/// Response after an upload was admitted.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub image_id: String,
    pub status: JobStatus,
    pub message: String,
}

/// Response for querying a job's state.
#[derive(Debug, Serialize)]
pub struct ImageStatusResponse {
    pub image_id: String,
    pub status: JobStatus,
    pub format: ImageFormat,
    pub filter: Option<Filter>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub protected: bool,
    pub error: Option<String>,
}

/// Response listing a random sample of public images.
#[derive(Debug, Serialize)]
pub struct RandomImagesResponse {
    pub image_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_filters_order() {
        let request = UploadRequest {
            apply_sepia: true,
            apply_grayscale: true,
            ..Default::default()
        };
        assert_eq!(
            request.requested_filters(),
            vec![Filter::Grayscale, Filter::Sepia]
        );
        assert!(UploadRequest::default().requested_filters().is_empty());
    }

    #[test]
    fn test_resize_target_bounds() {
        assert!(ResizeTarget { width: 32, height: 2560 }.validate().is_ok());
        assert!(ResizeTarget { width: 31, height: 100 }.validate().is_err());
        assert!(ResizeTarget { width: 100, height: 2561 }.validate().is_err());
    }
}
