use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    Local,
    R2,
}

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task queue
    pub redis_url: String,

    /// Where originals and processed files live
    #[serde(default = "default_storage_backend")]
    pub storage_backend: StorageBackendKind,

    /// Root directory of the local backend
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// Delay before an admitted task becomes deliverable
    #[serde(default = "default_enqueue_delay_secs")]
    pub enqueue_delay_secs: u64,

    /// Lifetime of an image record and its files
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,

    /// Period of the expiry sweep
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Concurrent tasks per worker process
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Sleep between polls of an empty queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_backend() -> StorageBackendKind {
    StorageBackendKind::Local
}

fn default_storage_root() -> String {
    "storage".to_string()
}

fn default_enqueue_delay_secs() -> u64 {
    5
}

fn default_retention_days() -> i64 {
    7
}

fn default_cleanup_interval_secs() -> u64 {
    15 * 60
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Credentials for the R2 backend, present only when it is selected.
#[derive(Debug, Clone)]
pub struct R2Settings {
    pub bucket: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Timing and sizing knobs handed to admission, the worker pool and the
/// scheduler at startup.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub enqueue_delay: Duration,
    pub retention: chrono::Duration,
    pub cleanup_interval: Duration,
    pub worker_concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            enqueue_delay: Duration::from_secs(default_enqueue_delay_secs()),
            retention: chrono::Duration::days(default_retention_days()),
            cleanup_interval: Duration::from_secs(default_cleanup_interval_secs()),
            worker_concurrency: default_worker_concurrency(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
        }
    }
}

/// Upper bound on `RETENTION_DAYS`; expiry timestamps must stay representable.
pub const MAX_RETENTION_DAYS: i64 = 36_500;

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.pipeline_settings()?;
        if config.storage_backend == StorageBackendKind::R2 {
            config.r2_settings()?;
        }
        Ok(config)
    }

    pub fn pipeline_settings(&self) -> Result<PipelineSettings, ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "WORKER_CONCURRENCY must be at least 1".to_string(),
            ));
        }
        if self.retention_days <= 0 || self.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::Invalid(format!(
                "RETENTION_DAYS must be between 1 and {MAX_RETENTION_DAYS}"
            )));
        }
        let retention = chrono::Duration::try_days(self.retention_days).ok_or_else(|| {
            ConfigError::Invalid("RETENTION_DAYS overflows a duration".to_string())
        })?;
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "CLEANUP_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }

        Ok(PipelineSettings {
            enqueue_delay: Duration::from_secs(self.enqueue_delay_secs),
            retention,
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            worker_concurrency: self.worker_concurrency,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        })
    }

    pub fn r2_settings(&self) -> Result<R2Settings, ConfigError> {
        let field = |value: &Option<String>, name: &str| {
            value
                .clone()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::Missing(name.to_string()))
        };

        Ok(R2Settings {
            bucket: field(&self.r2_bucket, "R2_BUCKET")?,
            endpoint: field(&self.r2_endpoint, "R2_ENDPOINT")?,
            access_key: field(&self.r2_access_key, "R2_ACCESS_KEY")?,
            secret_key: field(&self.r2_secret_key, "R2_SECRET_KEY")?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> AppConfig {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()));
        envy::from_iter(vars).expect("config should deserialize")
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/images"),
            ("REDIS_URL", "redis://localhost:6379/0"),
        ]);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.storage_backend, StorageBackendKind::Local);

        let settings = config.pipeline_settings().unwrap();
        assert_eq!(settings.enqueue_delay, Duration::from_secs(5));
        assert_eq!(settings.retention, chrono::Duration::days(7));
        assert_eq!(settings.cleanup_interval, Duration::from_secs(900));
        assert_eq!(settings.worker_concurrency, 4);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/images"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("WORKER_CONCURRENCY", "0"),
        ]);
        assert!(matches!(
            config.pipeline_settings(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/images"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("POLL_INTERVAL_MS", "0"),
        ]);
        assert!(matches!(
            config.pipeline_settings(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_oversized_retention_rejected() {
        for days in ["36501", "9223372036854775807"] {
            let config = config_from(&[
                ("DATABASE_URL", "postgres://localhost/images"),
                ("REDIS_URL", "redis://localhost:6379/0"),
                ("RETENTION_DAYS", days),
            ]);
            assert!(
                matches!(config.pipeline_settings(), Err(ConfigError::Invalid(_))),
                "{days}"
            );
        }

        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/images"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("RETENTION_DAYS", "36500"),
        ]);
        let settings = config.pipeline_settings().unwrap();
        assert!(chrono::Utc::now().checked_add_signed(settings.retention).is_some());
    }

    #[test]
    fn test_r2_requires_credentials() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://localhost/images"),
            ("REDIS_URL", "redis://localhost:6379/0"),
            ("STORAGE_BACKEND", "r2"),
            ("R2_BUCKET", "images"),
        ]);
        assert!(matches!(config.r2_settings(), Err(ConfigError::Missing(_))));
    }
}
