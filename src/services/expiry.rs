use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::app_state::AppState;
use crate::models::job::ImageRecord;
use crate::services::storage::Namespace;

/// Counts from one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub records_deleted: u64,
    pub files_deleted: u64,
    pub file_errors: u64,
    pub record_errors: u64,
    pub registrations_deleted: u64,
}

/// Periodic deletion of expired images and lapsed registrations.
pub struct ExpiryScheduler {
    state: AppState,
}

impl ExpiryScheduler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// One sweep. Individual failures are logged and skipped.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.state.images.list_expired(now).await {
            Ok(expired) => {
                for record in &expired {
                    self.reclaim(record, &mut report).await;
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to list expired images"),
        }

        match self.state.registrations.delete_lapsed(now).await {
            Ok(count) => report.registrations_deleted = count,
            Err(e) => tracing::error!(error = %e, "Failed to delete lapsed registrations"),
        }

        metrics::counter!("image_records_expired_total").increment(report.records_deleted);
        metrics::counter!("registrations_expired_total").increment(report.registrations_deleted);
        tracing::info!(
            records_deleted = report.records_deleted,
            files_deleted = report.files_deleted,
            file_errors = report.file_errors,
            record_errors = report.record_errors,
            registrations_deleted = report.registrations_deleted,
            "Expiry sweep finished"
        );
        report
    }

    async fn reclaim(&self, record: &ImageRecord, report: &mut SweepReport) {
        for namespace in [Namespace::Processed, Namespace::Originals] {
            match self.state.store.delete_in(namespace, &record.id, record.format).await {
                Ok(true) => report.files_deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    report.file_errors += 1;
                    tracing::warn!(
                        image_id = %record.id,
                        namespace = namespace.prefix(),
                        error = %e,
                        "Failed to delete expired file, continuing"
                    );
                }
            }
        }

        match self.state.images.delete(&record.id).await {
            Ok(true) => {
                report.records_deleted += 1;
                tracing::debug!(image_id = %record.id, status = %record.status, "Expired image removed");
            }
            Ok(false) => {}
            Err(e) => {
                report.record_errors += 1;
                tracing::warn!(image_id = %record.id, error = %e, "Failed to delete expired record, continuing");
            }
        }
    }

    /// Sweep every `cleanup_interval` until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.state.settings.cleanup_interval;
        tracing::info!(period_secs = period.as_secs(), "Expiry scheduler starting");

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Expiry scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineSettings;
    use crate::db::memory::{MemoryImageRepository, MemoryRegistrationRepository};
    use crate::db::ImageRepository;
    use crate::models::job::{ImageFormat, JobStatus, NewImageRecord};
    use crate::models::registration::PendingRegistration;
    use crate::services::queue::MemoryTaskQueue;
    use crate::services::storage::ImageStore;
    use chrono::Duration;
    use std::sync::Arc;

    struct Harness {
        scheduler: ExpiryScheduler,
        state: AppState,
        images: Arc<MemoryImageRepository>,
        registrations: Arc<MemoryRegistrationRepository>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let images = Arc::new(MemoryImageRepository::new());
        let registrations = Arc::new(MemoryRegistrationRepository::new());
        let state = AppState::new(
            images.clone(),
            registrations.clone(),
            ImageStore::local(dir.path()),
            Arc::new(MemoryTaskQueue::new()),
            PipelineSettings::default(),
        );
        Harness {
            scheduler: ExpiryScheduler::new(state.clone()),
            state,
            images,
            registrations,
            _dir: dir,
        }
    }

    async fn seed(h: &Harness, id: &str, expires_at: DateTime<Utc>) {
        h.images
            .insert(NewImageRecord {
                id: id.to_string(),
                format: ImageFormat::Jpeg,
                requested_filter: None,
                requested_size: None,
                access_secret_hash: None,
                created_at: expires_at - Duration::days(7),
                expires_at,
            })
            .await
            .unwrap();
    }

    fn registration(email: &str, expires_at: DateTime<Utc>, verified: bool) -> PendingRegistration {
        PendingRegistration {
            id: 1,
            email: email.to_string(),
            created_at: expires_at - Duration::days(1),
            expires_at,
            verified_at: verified.then_some(expires_at - Duration::hours(1)),
        }
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_record_and_files() {
        let h = harness();
        let now = Utc::now();
        seed(&h, "old", now - Duration::minutes(1)).await;
        h.state.store.put_original("old", ImageFormat::Jpeg, b"o").await.unwrap();
        h.state.store.put_processed("old", ImageFormat::Jpeg, b"p").await.unwrap();

        let report = h.scheduler.run_once(now).await;
        assert_eq!(report.records_deleted, 1);
        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.file_errors, 0);

        assert!(h.images.get("old").await.unwrap().is_none());
        assert!(!h.state.store.exists(Namespace::Originals, "old", ImageFormat::Jpeg).await.unwrap());
        assert!(!h.state.store.exists(Namespace::Processed, "old", ImageFormat::Jpeg).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_keeps_unexpired_records() {
        let h = harness();
        let now = Utc::now();
        seed(&h, "fresh", now + Duration::days(3)).await;
        h.state.store.put_original("fresh", ImageFormat::Jpeg, b"o").await.unwrap();

        let report = h.scheduler.run_once(now).await;
        assert_eq!(report, SweepReport::default());

        let record = h.images.get("fresh").await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Processing);
        assert!(h.state.store.exists(Namespace::Originals, "fresh", ImageFormat::Jpeg).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_tolerates_missing_files() {
        let h = harness();
        let now = Utc::now();
        seed(&h, "nofiles", now - Duration::days(1)).await;

        let report = h.scheduler.run_once(now).await;
        assert_eq!(report.records_deleted, 1);
        assert_eq!(report.files_deleted, 0);
        assert_eq!(report.file_errors, 0);
        assert!(h.images.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_deletes_only_lapsed_registrations() {
        let h = harness();
        let now = Utc::now();
        h.registrations.put(registration("lapsed@example.com", now - Duration::hours(2), false));
        h.registrations.put(registration("verified@example.com", now - Duration::hours(2), true));
        h.registrations.put(registration("pending@example.com", now + Duration::hours(2), false));

        let report = h.scheduler.run_once(now).await;
        assert_eq!(report.registrations_deleted, 1);

        let mut remaining = h.registrations.emails();
        remaining.sort();
        assert_eq!(remaining, vec!["pending@example.com", "verified@example.com"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness();
        let now = Utc::now();
        seed(&h, "old", now - Duration::minutes(5)).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(ExpiryScheduler::new(h.state.clone()).run(rx));

        // The first tick fires immediately.
        for _ in 0..100 {
            if h.images.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        tokio_test::assert_ok!(handle.await);
        assert!(h.images.is_empty());
    }
}
