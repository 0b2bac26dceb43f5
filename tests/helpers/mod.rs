//! Shared setup for pipeline tests: in-memory repositories and queue, a
//! temporary storage root, and generated images.

#![allow(dead_code)]

use image::{DynamicImage, Rgb, RgbImage, Rgba, RgbaImage};
use image_pipeline::{
    app_state::AppState,
    config::PipelineSettings,
    db::memory::{MemoryImageRepository, MemoryRegistrationRepository},
    models::{job::ImageFormat, upload::UploadRequest},
    services::{queue::MemoryTaskQueue, storage::ImageStore, transform},
};
use std::sync::Arc;
use std::time::Duration;

pub struct TestPipeline {
    pub state: AppState,
    pub images: Arc<MemoryImageRepository>,
    pub registrations: Arc<MemoryRegistrationRepository>,
    pub queue: Arc<MemoryTaskQueue>,
    pub root: tempfile::TempDir,
}

impl TestPipeline {
    /// Pipeline with no admission delay.
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(enqueue_delay: Duration) -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        let images = Arc::new(MemoryImageRepository::new());
        let registrations = Arc::new(MemoryRegistrationRepository::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        let state = AppState::new(
            images.clone(),
            registrations.clone(),
            ImageStore::local(root.path()),
            queue.clone(),
            PipelineSettings {
                enqueue_delay,
                worker_concurrency: 2,
                poll_interval: Duration::from_millis(10),
                ..PipelineSettings::default()
            },
        );
        Self {
            state,
            images,
            registrations,
            queue,
            root,
        }
    }
}

/// Opaque RGB gradient encoded as JPEG.
pub fn jpeg_image(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 2 % 256) as u8, (y * 2 % 256) as u8, 128])
    });
    transform::encode(&DynamicImage::ImageRgb8(image), ImageFormat::Jpeg)
        .expect("Failed to encode JPEG")
}

/// RGBA image with a transparent left half, encoded as PNG.
pub fn alpha_png(width: u32, height: u32) -> Vec<u8> {
    let image = RgbaImage::from_fn(width, height, |x, y| {
        let alpha = if x < width / 2 { 0 } else { 255 };
        Rgba([(x * 4 % 256) as u8, (y * 4 % 256) as u8, 200, alpha])
    });
    transform::encode(&DynamicImage::ImageRgba8(image), ImageFormat::Png)
        .expect("Failed to encode PNG")
}

/// An upload of `bytes` declared as `content_type`, targeting `format`.
pub fn upload(bytes: Vec<u8>, content_type: &str, format: &str) -> UploadRequest {
    UploadRequest {
        bytes,
        content_type: content_type.to_string(),
        format: Some(format.to_string()),
        ..UploadRequest::default()
    }
}
