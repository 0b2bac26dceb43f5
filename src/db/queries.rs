use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use crate::db::{DbError, FinalizeResult, ImageRepository};
use crate::models::job::{
    Dimensions, Filter, ImageFormat, ImageRecord, JobOutcome, JobStatus, NewImageRecord,
};

const IMAGE_COLUMNS: &str = r#"
    id, format, requested_filter, requested_width, requested_height, width, height,
    protected, access_secret_hash, status, failure_reason, created_at, expires_at,
    completed_at
"#;

/// PostgreSQL-backed image records.
#[derive(Clone)]
pub struct PgImageRepository {
    pool: PgPool,
}

impl PgImageRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn corrupt(id: &str, detail: impl Into<String>) -> DbError {
    DbError::Corrupt {
        id: id.to_string(),
        detail: detail.into(),
    }
}

fn dimensions(width: Option<i32>, height: Option<i32>) -> Option<Dimensions> {
    match (width, height) {
        (Some(w), Some(h)) if w >= 0 && h >= 0 => Some(Dimensions::new(w as u32, h as u32)),
        _ => None,
    }
}

fn row_to_record(row: &PgRow) -> Result<ImageRecord, DbError> {
    let id: String = row.try_get("id")?;

    let format_str: String = row.try_get("format")?;
    let format = ImageFormat::from_db(&format_str)
        .ok_or_else(|| corrupt(&id, format!("unknown format {format_str}")))?;

    let status_str: String = row.try_get("status")?;
    let status = JobStatus::from_str(&status_str)
        .map_err(|_| corrupt(&id, format!("unknown status {status_str}")))?;

    let filter_str: Option<String> = row.try_get("requested_filter")?;
    let requested_filter = filter_str
        .map(|f| Filter::from_str(&f).map_err(|_| corrupt(&id, format!("unknown filter {f}"))))
        .transpose()?;

    Ok(ImageRecord {
        format,
        requested_filter,
        requested_size: dimensions(
            row.try_get("requested_width")?,
            row.try_get("requested_height")?,
        ),
        size: dimensions(row.try_get("width")?, row.try_get("height")?),
        protected: row.try_get("protected")?,
        access_secret_hash: row.try_get("access_secret_hash")?,
        status,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        completed_at: row.try_get("completed_at")?,
        id,
    })
}

#[async_trait]
impl ImageRepository for PgImageRepository {
    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, DbError> {
        let sql = format!(
            r#"
            INSERT INTO images (id, format, requested_filter, requested_width, requested_height,
                                protected, access_secret_hash, status, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {IMAGE_COLUMNS}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(&record.id)
            .bind(record.format.as_db())
            .bind(record.requested_filter.map(|f| f.to_string()))
            .bind(record.requested_size.map(|d| d.width as i32))
            .bind(record.requested_size.map(|d| d.height as i32))
            .bind(record.access_secret_hash.is_some())
            .bind(&record.access_secret_hash)
            .bind(JobStatus::Processing.to_string())
            .bind(record.created_at)
            .bind(record.expires_at)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(row) => row_to_record(&row),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(DbError::DuplicateId(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, DbError> {
        let sql = format!("SELECT {IMAGE_COLUMNS} FROM images WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn finalize(&self, id: &str, outcome: &JobOutcome) -> Result<FinalizeResult, DbError> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM images WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(current) = current else {
            tx.rollback().await?;
            return Ok(FinalizeResult::Missing);
        };
        let current = JobStatus::from_str(&current)
            .map_err(|_| corrupt(id, format!("unknown status {current}")))?;
        if !outcome.applies_to(current) {
            tx.rollback().await?;
            return Ok(FinalizeResult::AlreadyTerminal);
        }

        match outcome {
            JobOutcome::Completed { size } => {
                // Without a resize the stored dimensions stay as they were.
                sqlx::query(
                    r#"
                    UPDATE images
                    SET status = $1,
                        width = COALESCE($2, width),
                        height = COALESCE($3, height),
                        failure_reason = NULL,
                        completed_at = NOW()
                    WHERE id = $4
                    "#,
                )
                .bind(JobStatus::Completed.to_string())
                .bind(size.map(|d| d.width as i32))
                .bind(size.map(|d| d.height as i32))
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
            JobOutcome::Failed { reason } => {
                sqlx::query(
                    r#"
                    UPDATE images
                    SET status = $1,
                        failure_reason = $2,
                        completed_at = NOW()
                    WHERE id = $3 AND status = $4
                    "#,
                )
                .bind(JobStatus::Failed.to_string())
                .bind(reason)
                .bind(id)
                .bind(JobStatus::Processing.to_string())
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(FinalizeResult::Applied)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ImageRecord>, DbError> {
        let sql = format!(
            "SELECT {IMAGE_COLUMNS} FROM images WHERE expires_at < $1 ORDER BY expires_at ASC"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let result = sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn sample_public_completed(&self, limit: usize) -> Result<Vec<String>, DbError> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM images
            WHERE protected = FALSE AND status = $1
            ORDER BY random()
            LIMIT $2
            "#,
        )
        .bind(JobStatus::Completed.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn ping(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
