use sqlx::PgPool;
use std::sync::Arc;

use crate::config::{AppConfig, ConfigError, PipelineSettings, StorageBackendKind};
use crate::db::{
    self, queries::PgImageRepository, registration_queries::PgRegistrationRepository, DbError,
    ImageRepository, RegistrationRepository,
};
use crate::services::{
    queue::{QueueError, RedisTaskQueue, TaskQueue},
    storage::{BlobBackend, ImageStore, LocalBackend, R2Backend, StorageError},
};

/// Shared state passed to route handlers, workers and the scheduler.
#[derive(Clone)]
pub struct AppState {
    pub images: Arc<dyn ImageRepository>,
    pub registrations: Arc<dyn RegistrationRepository>,
    pub store: ImageStore,
    pub queue: Arc<dyn TaskQueue>,
    pub settings: PipelineSettings,
}

impl AppState {
    pub fn new(
        images: Arc<dyn ImageRepository>,
        registrations: Arc<dyn RegistrationRepository>,
        store: ImageStore,
        queue: Arc<dyn TaskQueue>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            images,
            registrations,
            store,
            queue,
            settings,
        }
    }

    /// Connect PostgreSQL, Redis and the configured storage backend.
    pub async fn connect(config: &AppConfig) -> Result<Self, StartupError> {
        tracing::info!("Connecting to PostgreSQL database");
        let pool = db::init_pool(&config.database_url).await?;
        Self::from_pool(config, pool)
    }

    /// Build the state around an existing PostgreSQL pool.
    pub fn from_pool(config: &AppConfig, pool: PgPool) -> Result<Self, StartupError> {
        let settings = config.pipeline_settings()?;

        tracing::info!("Connecting to Redis task queue");
        let queue = RedisTaskQueue::new(&config.redis_url)?;

        let backend: Arc<dyn BlobBackend> = match config.storage_backend {
            StorageBackendKind::Local => {
                tracing::info!(root = %config.storage_root, "Using local image storage");
                Arc::new(LocalBackend::new(&config.storage_root))
            }
            StorageBackendKind::R2 => {
                tracing::info!("Initializing R2 storage client");
                Arc::new(R2Backend::new(&config.r2_settings()?)?)
            }
        };

        Ok(Self::new(
            Arc::new(PgImageRepository::new(pool.clone())),
            Arc::new(PgRegistrationRepository::new(pool)),
            ImageStore::new(backend),
            Arc::new(queue),
            settings,
        ))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
