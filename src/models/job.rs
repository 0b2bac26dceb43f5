use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Status of an image transformation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Output format of a job. Fixed at admission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ImageFormat {
    Jpeg,
    Png,
}

/// The single table mapping a format to its storage extension and MIME type.
const FORMAT_TABLE: &[(ImageFormat, &str, &str)] = &[
    (ImageFormat::Jpeg, "jpg", "image/jpeg"),
    (ImageFormat::Png, "png", "image/png"),
];

/// Extensions accepted from callers, with the format each one selects.
const EXTENSION_ALIASES: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
];

pub const OCTET_STREAM: &str = "application/octet-stream";

impl ImageFormat {
    /// Parse a caller-supplied target format (`jpg`, `jpeg`, `png`, any case).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim().to_ascii_lowercase();
        EXTENSION_ALIASES
            .iter()
            .find(|(alias, _)| *alias == ext)
            .map(|(_, format)| *format)
    }

    /// Parse the value persisted in the `format` column.
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "JPEG" => Some(ImageFormat::Jpeg),
            "PNG" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    pub fn as_db(self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Png => "PNG",
        }
    }

    pub fn extension(self) -> &'static str {
        self.entry().1
    }

    pub fn mime_type(self) -> &'static str {
        self.entry().2
    }

    /// Codec used by the `image` crate for this format.
    pub fn codec(self) -> image::ImageFormat {
        match self {
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::Png => image::ImageFormat::Png,
        }
    }

    fn entry(self) -> &'static (ImageFormat, &'static str, &'static str) {
        FORMAT_TABLE
            .iter()
            .find(|(format, _, _)| *format == self)
            .unwrap_or(&FORMAT_TABLE[0])
    }
}

/// MIME type for a stored file extension. Unknown extensions are served as
/// an octet stream.
pub fn mime_for_extension(ext: &str) -> &'static str {
    ImageFormat::from_extension(ext)
        .map(ImageFormat::mime_type)
        .unwrap_or(OCTET_STREAM)
}

/// The pixel filters a job may request. At most one per job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Filter {
    Grayscale,
    ColorInversion,
    Sepia,
    Blur,
}

/// Exact output dimensions of a resize.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// An image transformation job as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub format: ImageFormat,
    pub requested_filter: Option<Filter>,
    pub requested_size: Option<Dimensions>,
    /// Final dimensions, set when a resize completed.
    pub size: Option<Dimensions>,
    pub protected: bool,
    #[serde(skip_serializing)]
    pub access_secret_hash: Option<String>,
    pub status: JobStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImageRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Fields written when admission creates a record.
#[derive(Debug, Clone)]
pub struct NewImageRecord {
    pub id: String,
    pub format: ImageFormat,
    pub requested_filter: Option<Filter>,
    pub requested_size: Option<Dimensions>,
    pub access_secret_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewImageRecord {
    pub fn into_record(self) -> ImageRecord {
        ImageRecord {
            id: self.id,
            format: self.format,
            requested_filter: self.requested_filter,
            requested_size: self.requested_size,
            size: None,
            protected: self.access_secret_hash.is_some(),
            access_secret_hash: self.access_secret_hash,
            status: JobStatus::Processing,
            failure_reason: None,
            created_at: self.created_at,
            expires_at: self.expires_at,
            completed_at: None,
        }
    }
}

/// Terminal state computed by a worker before it is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { size: Option<Dimensions> },
    Failed { reason: String },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed { .. } => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
        }
    }

    /// Whether a record in `current` may take this outcome. Only
    /// `PROCESSING` moves; a `COMPLETED` record may only be re-completed.
    pub fn applies_to(&self, current: JobStatus) -> bool {
        match (current, self) {
            (JobStatus::Processing, _) => true,
            (JobStatus::Completed, JobOutcome::Completed { .. }) => true,
            (JobStatus::Completed, JobOutcome::Failed { .. }) => false,
            (JobStatus::Failed, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_format_aliases() {
        assert_eq!(ImageFormat::from_extension("JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension(" jpeg "), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_extension("png"), Some(ImageFormat::Png));
        assert_eq!(ImageFormat::from_extension("gif"), None);
        assert_eq!(ImageFormat::from_extension(""), None);
    }

    #[test]
    fn test_extension_and_mime_come_from_one_table() {
        assert_eq!(ImageFormat::Jpeg.extension(), "jpg");
        assert_eq!(ImageFormat::Png.extension(), "png");
        assert_eq!(ImageFormat::Jpeg.mime_type(), "image/jpeg");
        assert_eq!(ImageFormat::Png.mime_type(), "image/png");
    }

    #[test]
    fn test_mime_for_extension() {
        assert_eq!(mime_for_extension("jpg"), "image/jpeg");
        assert_eq!(mime_for_extension("jpeg"), "image/jpeg");
        assert_eq!(mime_for_extension("png"), "image/png");
        assert_eq!(mime_for_extension("webp"), OCTET_STREAM);
    }

    #[test]
    fn test_db_format_roundtrip() {
        for format in [ImageFormat::Jpeg, ImageFormat::Png] {
            assert_eq!(ImageFormat::from_db(format.as_db()), Some(format));
        }
        assert_eq!(ImageFormat::from_db("jpg"), None);
    }

    #[test]
    fn test_filter_names() {
        assert_eq!(Filter::ColorInversion.to_string(), "color_inversion");
        assert_eq!(Filter::from_str("sepia").unwrap(), Filter::Sepia);
        assert!(Filter::from_str("emboss").is_err());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(JobStatus::Processing.to_string(), "PROCESSING");
        assert_eq!(JobStatus::from_str("COMPLETED").unwrap(), JobStatus::Completed);
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_terminal_records_never_fail_again() {
        let completed = JobOutcome::Completed { size: None };
        let failed = JobOutcome::Failed {
            reason: "boom".to_string(),
        };

        assert!(completed.applies_to(JobStatus::Processing));
        assert!(failed.applies_to(JobStatus::Processing));
        assert!(completed.applies_to(JobStatus::Completed));
        assert!(!failed.applies_to(JobStatus::Completed));
        assert!(!completed.applies_to(JobStatus::Failed));
        assert!(!failed.applies_to(JobStatus::Failed));
    }
}
