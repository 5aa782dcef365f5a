mod jobs;

pub use jobs::{FileMetadata, JobStatus, OcrJob};

use crate::analytics::LimitAnalytics;
use crate::config::{ConfigHandle, LimitsConfig};
use crate::decision::{DenyReason, LimitDecision, QuotaKind, TierUsage};
use crate::identity::Identity;
use crate::store::UsageStore;
use chrono::{DateTime, Duration, Utc};
use jobs::JobRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Read-only snapshot of the OCR tiers plus queue occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct OcrUsageStats {
    pub session_pages: TierUsage,
    pub session_documents: TierUsage,
    pub daily_pages: TierUsage,
    pub daily_documents: TierUsage,
    pub active_jobs: usize,
    pub pending_jobs: usize,
}

/// OCR quota engine and job lifecycle tracker.
///
/// Checks gate on the page estimate before any upload work happens; the
/// session and daily counters are charged only when a job completes with its
/// actual page count. Quota tracking only — OCR execution itself lives with
/// the caller.
pub struct OcrLimitEngine {
    config: ConfigHandle,
    store: Arc<dyn UsageStore>,
    analytics: Arc<LimitAnalytics>,
    jobs: JobRegistry,
}

impl OcrLimitEngine {
    pub fn new(
        config: ConfigHandle,
        store: Arc<dyn UsageStore>,
        analytics: Arc<LimitAnalytics>,
    ) -> Self {
        Self {
            config,
            store,
            analytics,
            jobs: JobRegistry::default(),
        }
    }

    /// Pre-quota file acceptance: size ceiling, then MIME allow-list.
    /// Independent of any user or session state.
    pub fn validate_file(&self, file: &FileMetadata, bypass_key: Option<&str>) -> LimitDecision {
        let config = self.config.load();
        if config.bypass.matches_ocr(bypass_key) {
            return LimitDecision::Bypassed;
        }
        if file.size_bytes > config.ocr.max_file_size_bytes {
            return LimitDecision::Denied(DenyReason::FileTooLarge {
                size_bytes: file.size_bytes,
                max_bytes: config.ocr.max_file_size_bytes,
            });
        }
        if !config.ocr.is_mime_type_allowed(&file.mime_type) {
            return LimitDecision::Denied(DenyReason::UnsupportedFileType {
                mime_type: file.mime_type.clone(),
            });
        }
        LimitDecision::Allowed
    }

    /// Ordered checks: bypass, pages/document, documents/session,
    /// pages/session, documents/day, pages/day, then queue capacity. The
    /// queue check is last because it reflects global load, not
    /// identity-scoped quota.
    pub fn check(
        &self,
        identity: &Identity,
        estimated_pages: u64,
        bypass_key: Option<&str>,
    ) -> LimitDecision {
        self.check_at(identity, estimated_pages, bypass_key, Utc::now())
    }

    pub(crate) fn check_at(
        &self,
        identity: &Identity,
        estimated_pages: u64,
        bypass_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> LimitDecision {
        let config = self.config.load();
        if config.bypass.matches_ocr(bypass_key) {
            debug!(user_id = %identity.user_id, "bypass for OCR check");
            return LimitDecision::Bypassed;
        }

        let limits = &config.ocr;
        if estimated_pages > limits.max_pages_per_document {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::PagesPerDocument,
                    limits.max_pages_per_document,
                    estimated_pages,
                    None,
                ),
            );
        }

        let (session_pages, session_documents) = self
            .store
            .session(&identity.session_id)
            .map(|s| (s.ocr_pages, s.ocr_documents))
            .unwrap_or((0, 0));
        if session_documents + 1 > limits.max_documents_per_session {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::DocumentsPerSession,
                    limits.max_documents_per_session,
                    session_documents,
                    None,
                ),
            );
        }
        if session_pages + estimated_pages > limits.max_pages_per_session {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::PagesPerSession,
                    limits.max_pages_per_session,
                    session_pages,
                    None,
                ),
            );
        }

        let daily = self.store.daily(&identity.user_id, now);
        if daily.ocr_documents_today + 1 > limits.max_documents_per_day {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::DocumentsPerDay,
                    limits.max_documents_per_day,
                    daily.ocr_documents_today,
                    Some(daily.daily_reset_at),
                ),
            );
        }
        if daily.ocr_pages_today + estimated_pages > limits.max_pages_per_day {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::PagesPerDay,
                    limits.max_pages_per_day,
                    daily.ocr_pages_today,
                    Some(daily.daily_reset_at),
                ),
            );
        }

        let active_jobs = self.jobs.active_count();
        if active_jobs >= limits.max_concurrent_jobs {
            return self.deny(
                identity,
                DenyReason::QueueFull {
                    active_jobs,
                    max_concurrent: limits.max_concurrent_jobs,
                },
            );
        }

        LimitDecision::Allowed
    }

    pub fn create_job(
        &self,
        identity: &Identity,
        file: FileMetadata,
        estimated_pages: u64,
    ) -> OcrJob {
        self.jobs.create(identity, &file, estimated_pages, Utc::now())
    }

    /// `Queued` → `Processing`. `None` for unknown IDs or any other state.
    pub fn start_job(&self, id: Uuid) -> Option<OcrJob> {
        self.jobs.start(id, Utc::now())
    }

    pub fn update_job_progress(&self, id: Uuid, progress: u8) -> Option<OcrJob> {
        self.jobs.update_progress(id, progress)
    }

    /// `Processing` → `Completed`. The sole path that charges session and
    /// daily page/document counters, using the actual page count.
    pub fn complete_job(&self, id: Uuid, actual_pages: u64) -> Option<OcrJob> {
        self.complete_job_at(id, actual_pages, Utc::now())
    }

    pub(crate) fn complete_job_at(
        &self,
        id: Uuid,
        actual_pages: u64,
        now: DateTime<Utc>,
    ) -> Option<OcrJob> {
        let job = self.jobs.complete(id, actual_pages, now)?;
        self.store
            .update_session(&job.session_id, now, &mut |session| {
                session.ocr_pages += actual_pages;
                session.ocr_documents += 1;
            });
        self.store.update_daily(&job.user_id, now, &mut |daily| {
            daily.ocr_pages_today += actual_pages;
            daily.ocr_documents_today += 1;
        });
        debug!(
            job_id = %job.id,
            actual_pages,
            "completed OCR job and tracked usage"
        );
        Some(job)
    }

    pub fn fail_job(&self, id: Uuid, error: &str) -> Option<OcrJob> {
        self.jobs.fail(id, error, Utc::now())
    }

    pub fn cancel_job(&self, id: Uuid) -> Option<OcrJob> {
        self.jobs.cancel(id, Utc::now())
    }

    pub fn get_job(&self, id: Uuid) -> Option<OcrJob> {
        self.jobs.get(id)
    }

    pub fn session_jobs(&self, session_id: &str) -> Vec<OcrJob> {
        self.jobs.session_jobs(session_id)
    }

    /// Jobs in `Queued` or `Processing`; the number the queue-capacity gate
    /// compares against the concurrency cap.
    pub fn active_job_count(&self) -> usize {
        self.jobs.active_count()
    }

    pub fn pending_job_count(&self) -> usize {
        self.jobs.pending_count()
    }

    pub fn usage_stats(&self, identity: &Identity) -> OcrUsageStats {
        self.usage_stats_at(identity, Utc::now())
    }

    pub(crate) fn usage_stats_at(&self, identity: &Identity, now: DateTime<Utc>) -> OcrUsageStats {
        let config = self.config.load();
        let limits = &config.ocr;
        let (session_pages, session_documents) = self
            .store
            .session(&identity.session_id)
            .map(|s| (s.ocr_pages, s.ocr_documents))
            .unwrap_or((0, 0));
        let daily = self.store.daily(&identity.user_id, now);

        OcrUsageStats {
            session_pages: TierUsage::new(session_pages, limits.max_pages_per_session, None),
            session_documents: TierUsage::new(
                session_documents,
                limits.max_documents_per_session,
                None,
            ),
            daily_pages: TierUsage::new(
                daily.ocr_pages_today,
                limits.max_pages_per_day,
                Some(daily.daily_reset_at),
            ),
            daily_documents: TierUsage::new(
                daily.ocr_documents_today,
                limits.max_documents_per_day,
                Some(daily.daily_reset_at),
            ),
            active_jobs: self.jobs.active_count(),
            pending_jobs: self.jobs.pending_count(),
        }
    }

    /// Deletes the session record and cancels any of its still-queued jobs.
    pub fn reset_session(&self, session_id: &str) -> bool {
        let cancelled = self.jobs.cancel_queued_for_session(session_id, Utc::now());
        if cancelled > 0 {
            debug!(session_id, cancelled, "cancelled queued jobs on session reset");
        }
        self.store.remove_session(session_id).is_some() || cancelled > 0
    }

    /// One cleanup pass over the registry: purge terminal jobs past the
    /// retention window, fail processing jobs past the timeout. Returns
    /// `(purged, timed_out)`.
    pub fn sweep_jobs(&self) -> (usize, usize) {
        self.sweep_jobs_at(Utc::now())
    }

    pub(crate) fn sweep_jobs_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let config = self.config.load();
        let purged = self.jobs.purge_terminal(
            now,
            Duration::seconds(config.cleanup.job_retention_secs as i64),
        );
        let timed_out = self.jobs.fail_stale(
            now,
            Duration::seconds(config.ocr.processing_timeout_secs as i64),
        );
        (purged, timed_out)
    }

    pub fn refresh_config(&self) {
        self.config.refresh();
    }

    pub fn config(&self) -> Arc<LimitsConfig> {
        self.config.load()
    }

    fn deny(&self, identity: &Identity, reason: DenyReason) -> LimitDecision {
        self.analytics.record_denial(identity, &reason);
        debug!(
            user_id = %identity.user_id,
            session_id = %identity.session_id,
            kind = %reason.kind(),
            "OCR limit denied"
        );
        LimitDecision::Denied(reason)
    }
}
