//! In-process repositories for tests and local runs without PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::db::{DbError, FinalizeResult, ImageRepository, RegistrationRepository};
use crate::models::job::{ImageRecord, JobOutcome, JobStatus, NewImageRecord};
use crate::models::registration::PendingRegistration;

#[derive(Default)]
pub struct MemoryImageRepository {
    records: Mutex<HashMap<String, ImageRecord>>,
}

impl MemoryImageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, bypassing admission defaults.
    pub fn put(&self, record: ImageRecord) {
        self.lock().insert(record.id.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ImageRecord>> {
        // A poisoned map is still structurally valid.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ImageRepository for MemoryImageRepository {
    async fn insert(&self, record: NewImageRecord) -> Result<ImageRecord, DbError> {
        let mut records = self.lock();
        if records.contains_key(&record.id) {
            return Err(DbError::DuplicateId(record.id));
        }
        let record = record.into_record();
        records.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<Option<ImageRecord>, DbError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn finalize(&self, id: &str, outcome: &JobOutcome) -> Result<FinalizeResult, DbError> {
        let mut records = self.lock();
        let Some(current) = records.get(id) else {
            return Ok(FinalizeResult::Missing);
        };
        if !outcome.applies_to(current.status) {
            return Ok(FinalizeResult::AlreadyTerminal);
        }

        // Build the replacement first, then swap it in under the same lock.
        let mut next = current.clone();
        next.status = outcome.status();
        next.completed_at = Some(Utc::now());
        match outcome {
            JobOutcome::Completed { size } => {
                if size.is_some() {
                    next.size = *size;
                }
                next.failure_reason = None;
            }
            JobOutcome::Failed { reason } => {
                next.failure_reason = Some(reason.clone());
            }
        }
        records.insert(id.to_string(), next);
        Ok(FinalizeResult::Applied)
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<ImageRecord>, DbError> {
        let mut expired: Vec<ImageRecord> = self
            .lock()
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|r| r.expires_at);
        Ok(expired)
    }

    async fn delete(&self, id: &str) -> Result<bool, DbError> {
        Ok(self.lock().remove(id).is_some())
    }

    async fn sample_public_completed(&self, limit: usize) -> Result<Vec<String>, DbError> {
        let mut ids: Vec<String> = self
            .lock()
            .values()
            .filter(|r| !r.protected && r.status == JobStatus::Completed)
            .map(|r| r.id.clone())
            .collect();
        ids.shuffle(&mut rand::thread_rng());
        ids.truncate(limit);
        Ok(ids)
    }
}

#[derive(Default)]
pub struct MemoryRegistrationRepository {
    registrations: Mutex<Vec<PendingRegistration>>,
}

impl MemoryRegistrationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, registration: PendingRegistration) {
        self.lock().push(registration);
    }

    pub fn emails(&self) -> Vec<String> {
        self.lock().iter().map(|r| r.email.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingRegistration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RegistrationRepository for MemoryRegistrationRepository {
    async fn delete_lapsed(&self, now: DateTime<Utc>) -> Result<u64, DbError> {
        let mut registrations = self.lock();
        let before = registrations.len();
        registrations.retain(|r| !r.is_lapsed(now));
        Ok((before - registrations.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::{Dimensions, ImageFormat};
    use chrono::Duration;

    fn new_record(id: &str) -> NewImageRecord {
        let now = Utc::now();
        NewImageRecord {
            id: id.to_string(),
            format: ImageFormat::Png,
            requested_filter: None,
            requested_size: Some(Dimensions::new(64, 64)),
            access_secret_hash: None,
            created_at: now,
            expires_at: now + Duration::days(7),
        }
    }

    #[tokio::test]
    async fn test_insert_starts_processing() {
        let repo = MemoryImageRepository::new();
        let record = repo.insert(new_record("abc")).await.unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert!(!record.protected);
        assert!(matches!(
            repo.insert(new_record("abc")).await,
            Err(DbError::DuplicateId(_))
        ));
    }

    #[tokio::test]
    async fn test_finalize_never_leaves_failed() {
        let repo = MemoryImageRepository::new();
        repo.insert(new_record("abc")).await.unwrap();

        let failed = JobOutcome::Failed {
            reason: "decode".to_string(),
        };
        assert_eq!(
            repo.finalize("abc", &failed).await.unwrap(),
            FinalizeResult::Applied
        );

        let completed = JobOutcome::Completed { size: None };
        assert_eq!(
            repo.finalize("abc", &completed).await.unwrap(),
            FinalizeResult::AlreadyTerminal
        );
        let record = repo.get("abc").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure_reason.as_deref(), Some("decode"));

        assert_eq!(
            repo.finalize("missing", &completed).await.unwrap(),
            FinalizeResult::Missing
        );
    }

    #[tokio::test]
    async fn test_finalize_keeps_completed_on_failure() {
        let repo = MemoryImageRepository::new();
        repo.insert(new_record("abc")).await.unwrap();

        let completed = JobOutcome::Completed {
            size: Some(Dimensions::new(64, 64)),
        };
        assert_eq!(
            repo.finalize("abc", &completed).await.unwrap(),
            FinalizeResult::Applied
        );

        let failed = JobOutcome::Failed {
            reason: "storage".to_string(),
        };
        assert_eq!(
            repo.finalize("abc", &failed).await.unwrap(),
            FinalizeResult::AlreadyTerminal
        );

        // Re-completion of the same job is accepted.
        assert_eq!(
            repo.finalize("abc", &completed).await.unwrap(),
            FinalizeResult::Applied
        );
        let record = repo.get("abc").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.failure_reason, None);
    }

    #[tokio::test]
    async fn test_lapsed_registrations_removed() {
        let repo = MemoryRegistrationRepository::new();
        let now = Utc::now();
        let registration = |id: i64, email: &str, expires_in: i64, verified: bool| {
            PendingRegistration {
                id,
                email: email.to_string(),
                created_at: now - Duration::days(2),
                expires_at: now + Duration::hours(expires_in),
                verified_at: verified.then_some(now),
            }
        };
        repo.put(registration(1, "lapsed@example.com", -1, false));
        repo.put(registration(2, "verified@example.com", -1, true));
        repo.put(registration(3, "pending@example.com", 1, false));

        assert_eq!(repo.delete_lapsed(now).await.unwrap(), 1);
        assert_eq!(
            repo.emails(),
            vec!["verified@example.com".to_string(), "pending@example.com".to_string()]
        );
    }
}
