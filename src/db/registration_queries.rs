use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db::{DbError, RegistrationRepository};

/// PostgreSQL-backed pending registrations.
#[derive(Clone)]
pub struct PgRegistrationRepository {
    pool: PgPool,
}

impl PgRegistrationRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistrationRepository for PgRegistrationRepository {
    async fn delete_lapsed(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_registrations
            WHERE verified_at IS NULL AND expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
