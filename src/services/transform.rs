//! Pixel-level transformations applied by the worker.
//!
//! The order is fixed: decode, resize, split alpha (PNG targets only), apply
//! at most one filter to the color channels, reattach alpha, encode.

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, GrayAlphaImage, GrayImage, ImageBuffer, Luma, LumaA, Rgb, RgbImage, Rgba, RgbaImage};

use crate::models::job::{Dimensions, Filter, ImageFormat};

/// Standard deviation of the Gaussian blur, in pixels.
pub const BLUR_SIGMA: f32 = 6.0;

/// Baseline JPEG quality for re-encoded outputs.
pub const JPEG_QUALITY: u8 = 75;

/// Row-major sepia matrix applied to (R, G, B).
pub const SEPIA_MATRIX: [[f64; 3]; 3] = [
    [0.393, 0.769, 0.189],
    [0.349, 0.686, 0.168],
    [0.272, 0.534, 0.131],
];

/// What to do to one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformSpec {
    pub format: ImageFormat,
    pub resize: Option<Dimensions>,
    pub filter: Option<Filter>,
}

/// Encoded output of a transformation.
#[derive(Debug, Clone)]
pub struct TransformOutput {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Color channels of an image with any alpha removed.
#[derive(Debug, Clone)]
pub enum ColorPlane {
    Luma(GrayImage),
    Rgb(RgbImage),
}

impl ColorPlane {
    fn from_image(image: &DynamicImage) -> Self {
        if image.color().has_color() {
            ColorPlane::Rgb(image.to_rgb8())
        } else {
            ColorPlane::Luma(image.to_luma8())
        }
    }

    fn into_rgb(self) -> RgbImage {
        match self {
            ColorPlane::Rgb(rgb) => rgb,
            ColorPlane::Luma(gray) => DynamicImage::ImageLuma8(gray).to_rgb8(),
        }
    }

    fn into_dynamic(self) -> DynamicImage {
        match self {
            ColorPlane::Luma(gray) => DynamicImage::ImageLuma8(gray),
            ColorPlane::Rgb(rgb) => DynamicImage::ImageRgb8(rgb),
        }
    }

    fn with_alpha(self, alpha: &GrayImage) -> Result<DynamicImage, TransformError> {
        let (width, height) = alpha.dimensions();
        match self {
            ColorPlane::Luma(gray) => {
                ensure_same_size(gray.dimensions(), (width, height))?;
                let merged: GrayAlphaImage = ImageBuffer::from_fn(width, height, |x, y| {
                    LumaA([gray.get_pixel(x, y)[0], alpha.get_pixel(x, y)[0]])
                });
                Ok(DynamicImage::ImageLumaA8(merged))
            }
            ColorPlane::Rgb(rgb) => {
                ensure_same_size(rgb.dimensions(), (width, height))?;
                let merged: RgbaImage = ImageBuffer::from_fn(width, height, |x, y| {
                    let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
                    Rgba([r, g, b, alpha.get_pixel(x, y)[0]])
                });
                Ok(DynamicImage::ImageRgba8(merged))
            }
        }
    }
}

fn ensure_same_size(color: (u32, u32), alpha: (u32, u32)) -> Result<(), TransformError> {
    if color == alpha {
        Ok(())
    } else {
        Err(TransformError::AlphaMismatch { color, alpha })
    }
}

type FilterHandler = fn(ColorPlane) -> ColorPlane;

/// One handler per filter variant.
fn handler_for(filter: Filter) -> FilterHandler {
    match filter {
        Filter::Grayscale => grayscale,
        Filter::ColorInversion => invert,
        Filter::Sepia => sepia,
        Filter::Blur => blur,
    }
}

/// ITU-R 601-2 luma with 16-bit fixed-point rounding.
pub fn luma_601(r: u8, g: u8, b: u8) -> u8 {
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

fn grayscale(plane: ColorPlane) -> ColorPlane {
    match plane {
        ColorPlane::Luma(gray) => ColorPlane::Luma(gray),
        ColorPlane::Rgb(rgb) => {
            let gray: GrayImage = ImageBuffer::from_fn(rgb.width(), rgb.height(), |x, y| {
                let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
                Luma([luma_601(r, g, b)])
            });
            ColorPlane::Luma(gray)
        }
    }
}

fn invert(plane: ColorPlane) -> ColorPlane {
    match plane {
        ColorPlane::Luma(mut gray) => {
            gray.pixels_mut().for_each(|p| p[0] = 255 - p[0]);
            ColorPlane::Luma(gray)
        }
        ColorPlane::Rgb(mut rgb) => {
            for pixel in rgb.pixels_mut() {
                for channel in pixel.0.iter_mut() {
                    *channel = 255 - *channel;
                }
            }
            ColorPlane::Rgb(rgb)
        }
    }
}

/// Sepia tone of one pixel: matrix product, clamped to 0..=255, then truncated.
pub fn sepia_pixel(r: u8, g: u8, b: u8) -> [u8; 3] {
    let input = [r as f64, g as f64, b as f64];
    SEPIA_MATRIX.map(|row| {
        let value = row[0] * input[0] + row[1] * input[1] + row[2] * input[2];
        value.clamp(0.0, 255.0) as u8
    })
}

fn sepia(plane: ColorPlane) -> ColorPlane {
    let mut rgb = plane.into_rgb();
    for pixel in rgb.pixels_mut() {
        let Rgb([r, g, b]) = *pixel;
        *pixel = Rgb(sepia_pixel(r, g, b));
    }
    ColorPlane::Rgb(rgb)
}

fn blur(plane: ColorPlane) -> ColorPlane {
    match plane {
        ColorPlane::Luma(gray) => ColorPlane::Luma(imageops::blur(&gray, BLUR_SIGMA)),
        ColorPlane::Rgb(rgb) => ColorPlane::Rgb(imageops::blur(&rgb, BLUR_SIGMA)),
    }
}

/// Decode stored bytes using the record's format.
pub fn decode(bytes: &[u8], format: ImageFormat) -> Result<DynamicImage, TransformError> {
    image::load_from_memory_with_format(bytes, format.codec()).map_err(TransformError::Decode)
}

/// Resize, then apply the filter with alpha preserved for PNG targets.
pub fn apply(image: DynamicImage, spec: &TransformSpec) -> Result<DynamicImage, TransformError> {
    let image = match spec.resize {
        Some(size) => {
            if size.width == 0 || size.height == 0 {
                return Err(TransformError::InvalidResize(size));
            }
            image.resize_exact(size.width, size.height, FilterType::CatmullRom)
        }
        None => image,
    };

    let keep_alpha = spec.format == ImageFormat::Png && image.color().has_alpha();
    let (plane, alpha) = if keep_alpha {
        let alpha: GrayImage = ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
            Luma([image.get_pixel(x, y)[3]])
        });
        (ColorPlane::from_image(&image), Some(alpha))
    } else {
        (ColorPlane::from_image(&image), None)
    };

    let plane = match spec.filter {
        Some(filter) => handler_for(filter)(plane),
        None => plane,
    };

    match alpha {
        Some(alpha) => plane.with_alpha(&alpha),
        None => Ok(plane.into_dynamic()),
    }
}

/// Encode for the target format. JPEG outputs are always baseline RGB.
pub fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, TransformError> {
    let mut bytes = Vec::new();
    match format {
        ImageFormat::Png => {
            image
                .write_with_encoder(PngEncoder::new(&mut bytes))
                .map_err(TransformError::Encode)?;
        }
        ImageFormat::Jpeg => {
            let rgb = match image {
                DynamicImage::ImageRgb8(_) => image.clone(),
                other => DynamicImage::ImageRgb8(other.to_rgb8()),
            };
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut bytes, JPEG_QUALITY))
                .map_err(TransformError::Encode)?;
        }
    }
    Ok(bytes)
}

/// Full transformation of stored original bytes.
pub fn process(original: &[u8], spec: &TransformSpec) -> Result<TransformOutput, TransformError> {
    let decoded = decode(original, spec.format)?;
    let transformed = apply(decoded, spec)?;
    let (width, height) = transformed.dimensions();
    let bytes = encode(&transformed, spec.format)?;
    Ok(TransformOutput {
        bytes,
        width,
        height,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("Failed to decode image: {0}")]
    Decode(#[source] image::ImageError),

    #[error("Failed to encode image: {0}")]
    Encode(#[source] image::ImageError),

    #[error("Invalid resize target {}x{}", .0.width, .0.height)]
    InvalidResize(Dimensions),

    #[error("Alpha plane {alpha:?} does not match color plane {color:?}")]
    AlphaMismatch { color: (u32, u32), alpha: (u32, u32) },
}
