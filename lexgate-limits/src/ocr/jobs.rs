use crate::identity::Identity;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use tracing::{debug, warn};
use uuid::Uuid;

/// OCR job lifecycle. Once terminal, a status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Active jobs count against the concurrent-processing cap.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Processing)
    }
}

/// What the caller knows about an upload before any processing happens.
#[derive(Debug, Clone, Serialize)]
pub struct FileMetadata {
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

impl FileMetadata {
    pub fn new(
        filename: impl Into<String>,
        size_bytes: u64,
        mime_type: impl Into<String>,
    ) -> Self {
        Self {
            filename: filename.into(),
            size_bytes,
            mime_type: mime_type.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OcrJob {
    pub id: Uuid,
    pub user_id: String,
    pub session_id: String,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub estimated_pages: u64,
    /// Reported on completion; authoritative for usage tracking.
    pub actual_pages: Option<u64>,
    pub status: JobStatus,
    /// 0-100.
    pub progress: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-process registry of OCR jobs.
///
/// Every transition takes the per-key entry lock, so a job cannot race
/// between two transitions. Illegal transitions and unknown IDs return
/// `None` and leave state untouched.
#[derive(Debug, Default)]
pub(crate) struct JobRegistry {
    jobs: DashMap<Uuid, OcrJob>,
}

impl JobRegistry {
    pub fn create(
        &self,
        identity: &Identity,
        file: &FileMetadata,
        estimated_pages: u64,
        now: DateTime<Utc>,
    ) -> OcrJob {
        let job = OcrJob {
            id: Uuid::now_v7(),
            user_id: identity.user_id.clone(),
            session_id: identity.session_id.clone(),
            filename: file.filename.clone(),
            size_bytes: file.size_bytes,
            mime_type: file.mime_type.clone(),
            estimated_pages,
            actual_pages: None,
            status: JobStatus::Queued,
            progress: 0,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        };
        self.jobs.insert(job.id, job.clone());
        debug!(job_id = %job.id, filename = %job.filename, "queued OCR job");
        job
    }

    pub fn start(&self, id: Uuid, now: DateTime<Utc>) -> Option<OcrJob> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.status != JobStatus::Queued {
            return None;
        }
        entry.status = JobStatus::Processing;
        entry.started_at = Some(now);
        Some(entry.value().clone())
    }

    pub fn update_progress(&self, id: Uuid, progress: u8) -> Option<OcrJob> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.status != JobStatus::Processing {
            return None;
        }
        entry.progress = progress.min(100);
        Some(entry.value().clone())
    }

    pub fn complete(&self, id: Uuid, actual_pages: u64, now: DateTime<Utc>) -> Option<OcrJob> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.status != JobStatus::Processing {
            return None;
        }
        entry.status = JobStatus::Completed;
        entry.progress = 100;
        entry.actual_pages = Some(actual_pages);
        entry.completed_at = Some(now);
        Some(entry.value().clone())
    }

    /// Only `Processing` jobs can fail; a queued job that never starts is
    /// cancelled instead.
    pub fn fail(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Option<OcrJob> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.status != JobStatus::Processing {
            return None;
        }
        entry.status = JobStatus::Failed;
        entry.error = Some(error.to_string());
        entry.completed_at = Some(now);
        Some(entry.value().clone())
    }

    /// Bookkeeping only: there is no cooperative cancellation of in-flight
    /// external processing.
    pub fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Option<OcrJob> {
        let mut entry = self.jobs.get_mut(&id)?;
        if entry.status.is_terminal() {
            return None;
        }
        entry.status = JobStatus::Cancelled;
        entry.completed_at = Some(now);
        Some(entry.value().clone())
    }

    pub fn get(&self, id: Uuid) -> Option<OcrJob> {
        self.jobs.get(&id).map(|entry| entry.value().clone())
    }

    pub fn session_jobs(&self, session_id: &str) -> Vec<OcrJob> {
        let mut jobs: Vec<OcrJob> = self
            .jobs
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn active_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.status.is_active())
            .count()
    }

    pub fn pending_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.status == JobStatus::Queued)
            .count()
    }

    /// Cancels jobs still queued for a session ("clear chat" while uploads
    /// are pending). Jobs already processing keep running.
    pub fn cancel_queued_for_session(&self, session_id: &str, now: DateTime<Utc>) -> usize {
        let mut cancelled = 0;
        for mut entry in self.jobs.iter_mut() {
            if entry.session_id == session_id && entry.status == JobStatus::Queued {
                entry.status = JobStatus::Cancelled;
                entry.completed_at = Some(now);
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Drops terminal jobs older than the retention window. Counted inside
    /// the closure so jobs created mid-`retain` cannot skew the count.
    pub fn purge_terminal(&self, now: DateTime<Utc>, retain_for: Duration) -> usize {
        let cutoff = now - retain_for;
        let mut purged = 0;
        self.jobs.retain(|_, job| {
            if job.status.is_terminal()
                && job.completed_at.map(|at| at <= cutoff).unwrap_or(false)
            {
                purged += 1;
                false
            } else {
                true
            }
        });
        purged
    }

    /// Fails jobs stuck in `Processing` past the configured timeout, so a
    /// crashed worker cannot pin a concurrency slot forever.
    pub fn fail_stale(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let cutoff = now - timeout;
        let mut failed = 0;
        for mut entry in self.jobs.iter_mut() {
            if entry.status == JobStatus::Processing
                && entry.started_at.map(|at| at <= cutoff).unwrap_or(false)
            {
                entry.status = JobStatus::Failed;
                entry.error = Some("processing timed out".to_string());
                entry.completed_at = Some(now);
                failed += 1;
                warn!(job_id = %entry.id, "failed stale OCR job");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn registry_with_job(now: DateTime<Utc>) -> (JobRegistry, Uuid) {
        let registry = JobRegistry::default();
        let identity = Identity::new("u1", "s1");
        let file = FileMetadata::new("contract.pdf", 1024, "application/pdf");
        let job = registry.create(&identity, &file, 8, now);
        (registry, job.id)
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(now);

        let started = registry.start(id, now).unwrap();
        assert_eq!(started.status, JobStatus::Processing);
        assert_eq!(started.started_at, Some(now));

        let progressed = registry.update_progress(id, 40).unwrap();
        assert_eq!(progressed.progress, 40);

        let done = registry.complete(id, 7, now).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.actual_pages, Some(7));
        assert_eq!(done.progress, 100);
    }

    #[test]
    fn test_terminal_status_never_changes() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(now);
        registry.start(id, now);
        registry.complete(id, 5, now);

        assert!(registry.start(id, now).is_none());
        assert!(registry.cancel(id, now).is_none());
        assert!(registry.fail(id, "boom", now).is_none());
        assert!(registry.update_progress(id, 10).is_none());
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Completed);
        assert_eq!(registry.get(id).unwrap().actual_pages, Some(5));
    }

    #[test]
    fn test_fail_requires_processing() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(now);

        // Still queued: no worker owns it, so it cannot fail.
        assert!(registry.fail(id, "boom", now).is_none());
        assert_eq!(registry.get(id).unwrap().status, JobStatus::Queued);

        registry.start(id, now);
        assert_eq!(
            registry.fail(id, "boom", now).map(|j| j.status),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn test_start_requires_queued() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(now);
        registry.start(id, now);
        // Already processing.
        assert!(registry.start(id, now).is_none());
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, queued) = registry_with_job(now);
        assert_eq!(
            registry.cancel(queued, now).map(|j| j.status),
            Some(JobStatus::Cancelled)
        );

        let (registry, id) = registry_with_job(now);
        registry.start(id, now);
        assert_eq!(
            registry.cancel(id, now).map(|j| j.status),
            Some(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_unknown_job_ids_are_not_found() {
        let registry = JobRegistry::default();
        let id = Uuid::now_v7();
        let now = Utc::now();
        assert!(registry.start(id, now).is_none());
        assert!(registry.update_progress(id, 50).is_none());
        assert!(registry.complete(id, 1, now).is_none());
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_active_count_tracks_every_transition() {
        let now = at("2026-03-14T10:00:00Z");
        let registry = JobRegistry::default();
        let identity = Identity::new("u1", "s1");
        let file = FileMetadata::new("a.pdf", 10, "application/pdf");

        let a = registry.create(&identity, &file, 3, now);
        let b = registry.create(&identity, &file, 3, now);
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.pending_count(), 2);

        registry.start(a.id, now);
        assert_eq!(registry.active_count(), 2);
        assert_eq!(registry.pending_count(), 1);

        registry.complete(a.id, 3, now);
        assert_eq!(registry.active_count(), 1);

        registry.cancel(b.id, now);
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_progress_is_clamped() {
        let now = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(now);
        registry.start(id, now);
        let job = registry.update_progress(id, 250).unwrap();
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_purge_respects_retention_window() {
        let completed_at = at("2026-03-14T10:00:00Z");
        let (registry, id) = registry_with_job(completed_at);
        registry.start(id, completed_at);
        registry.complete(id, 4, completed_at);

        // Within the hour: kept.
        let purged = registry.purge_terminal(at("2026-03-14T10:30:00Z"), Duration::hours(1));
        assert_eq!(purged, 0);
        assert!(registry.get(id).is_some());

        // Past the hour: gone.
        let purged = registry.purge_terminal(at("2026-03-14T11:00:01Z"), Duration::hours(1));
        assert_eq!(purged, 1);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_purge_counts_correctly_under_concurrent_creation() {
        use std::sync::Arc;

        let registry = Arc::new(JobRegistry::default());
        let writer = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                let identity = Identity::new("u1", "s1");
                let file = FileMetadata::new("a.pdf", 10, "application/pdf");
                for _ in 0..1000 {
                    let job = registry.create(&identity, &file, 1, Utc::now());
                    registry.cancel(job.id, Utc::now());
                }
            })
        };

        // Zero retention: every terminal job is purgeable immediately, so
        // each pass removes entries while the writer keeps adding. The count
        // must stay sane (no underflow) on every pass.
        for _ in 0..500 {
            let purged =
                registry.purge_terminal(Utc::now() + Duration::seconds(1), Duration::zero());
            assert!(purged <= 1000);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_fail_stale_only_touches_old_processing_jobs() {
        let started = at("2026-03-14T10:00:00Z");
        let registry = JobRegistry::default();
        let identity = Identity::new("u1", "s1");
        let file = FileMetadata::new("a.pdf", 10, "application/pdf");

        let stuck = registry.create(&identity, &file, 3, started);
        registry.start(stuck.id, started);
        let queued = registry.create(&identity, &file, 3, started);

        let failed = registry.fail_stale(at("2026-03-14T10:06:00Z"), Duration::minutes(5));
        assert_eq!(failed, 1);
        assert_eq!(registry.get(stuck.id).unwrap().status, JobStatus::Failed);
        assert_eq!(
            registry.get(stuck.id).unwrap().error.as_deref(),
            Some("processing timed out")
        );
        // Queued jobs are not subject to the processing timeout.
        assert_eq!(registry.get(queued.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_cancel_queued_for_session_spares_other_sessions() {
        let now = at("2026-03-14T10:00:00Z");
        let registry = JobRegistry::default();
        let file = FileMetadata::new("a.pdf", 10, "application/pdf");
        let mine = registry.create(&Identity::new("u1", "s1"), &file, 2, now);
        let processing = registry.create(&Identity::new("u1", "s1"), &file, 2, now);
        registry.start(processing.id, now);
        let other = registry.create(&Identity::new("u2", "s2"), &file, 2, now);

        let cancelled = registry.cancel_queued_for_session("s1", now);
        assert_eq!(cancelled, 1);
        assert_eq!(registry.get(mine.id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(
            registry.get(processing.id).unwrap().status,
            JobStatus::Processing
        );
        assert_eq!(registry.get(other.id).unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn test_session_jobs_sorted_by_creation() {
        let registry = JobRegistry::default();
        let identity = Identity::new("u1", "s1");
        let file = FileMetadata::new("a.pdf", 10, "application/pdf");
        registry.create(&identity, &file, 1, at("2026-03-14T10:02:00Z"));
        registry.create(&identity, &file, 1, at("2026-03-14T10:01:00Z"));
        registry.create(&Identity::new("u2", "s2"), &file, 1, at("2026-03-14T10:00:00Z"));

        let jobs = registry.session_jobs("s1");
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].created_at <= jobs[1].created_at);
    }
}
