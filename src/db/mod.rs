use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::job::{ImageRecord, JobOutcome, NewImageRecord};

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Result of committing a worker's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeResult {
    /// The record now holds the outcome.
    Applied,
    /// The record is terminal and the outcome would move it; left untouched.
    AlreadyTerminal,
    /// No record with that id exists.
    Missing,
}

/// Durable storage of image job records.
#[async_trait]
pub trait ImageRepository: Send + Sync {
    /// Insert a new record in `PROCESSING` state.
    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, DbError>;

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, DbError>;

    /// Commit a terminal state in one transaction. Only a `PROCESSING` record
    /// changes state; a `COMPLETED` record accepts only a repeated completion.
    async fn finalize(&self, id: &str, outcome: &JobOutcome) -> Result<FinalizeResult, DbError>;

    /// Records whose `expires_at` is before `now`.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ImageRecord>, DbError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> Result<bool, DbError>;

    /// Up to `limit` random ids of completed, unprotected records.
    async fn sample_public_completed(&self, limit: usize) -> Result<Vec<String>, DbError>;

    /// Check connectivity (for health checks).
    async fn ping(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Registrations awaiting email verification.
#[async_trait]
pub trait RegistrationRepository: Send + Sync {
    /// Delete unverified registrations whose window closed before `now`.
    async fn delete_lapsed(&self, now: DateTime<Utc>) -> Result<u64, DbError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Duplicate image id: {0}")]
    DuplicateId(String),

    #[error("Corrupt row {id}: {detail}")]
    Corrupt { id: String, detail: String },
}

pub mod memory;
pub mod queries;
pub mod registration_queries;
