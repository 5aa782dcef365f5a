use chrono::{DateTime, Utc};
use serde::Serialize;
use strum::Display;

/// Full taxonomy of limits a request can trip, as reported to callers and
/// the analytics log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LimitKind {
    PerRequest,
    Session,
    Daily,
    Monthly,
    FileSize,
    FileType,
    PagesPerDocument,
    PagesPerSession,
    PagesPerDay,
    DocumentsPerSession,
    DocumentsPerDay,
    QueueFull,
}

/// The subset of [`LimitKind`] measured in countable units (tokens, pages,
/// documents) against a numeric ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum QuotaKind {
    PerRequest,
    Session,
    Daily,
    Monthly,
    PagesPerDocument,
    PagesPerSession,
    PagesPerDay,
    DocumentsPerSession,
    DocumentsPerDay,
}

impl From<QuotaKind> for LimitKind {
    fn from(kind: QuotaKind) -> Self {
        match kind {
            QuotaKind::PerRequest => LimitKind::PerRequest,
            QuotaKind::Session => LimitKind::Session,
            QuotaKind::Daily => LimitKind::Daily,
            QuotaKind::Monthly => LimitKind::Monthly,
            QuotaKind::PagesPerDocument => LimitKind::PagesPerDocument,
            QuotaKind::PagesPerSession => LimitKind::PagesPerSession,
            QuotaKind::PagesPerDay => LimitKind::PagesPerDay,
            QuotaKind::DocumentsPerSession => LimitKind::DocumentsPerSession,
            QuotaKind::DocumentsPerDay => LimitKind::DocumentsPerDay,
        }
    }
}

/// Why a request was denied. One variant per limit family, so a denial only
/// carries the fields that make sense for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    Quota {
        kind: QuotaKind,
        limit: u64,
        used: u64,
        remaining: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        reset_at: Option<DateTime<Utc>>,
    },
    FileTooLarge {
        size_bytes: u64,
        max_bytes: u64,
    },
    UnsupportedFileType {
        mime_type: String,
    },
    QueueFull {
        active_jobs: usize,
        max_concurrent: usize,
    },
}

impl DenyReason {
    pub(crate) fn quota(
        kind: QuotaKind,
        limit: u64,
        used: u64,
        reset_at: Option<DateTime<Utc>>,
    ) -> Self {
        DenyReason::Quota {
            kind,
            limit,
            used,
            remaining: limit.saturating_sub(used),
            reset_at,
        }
    }

    pub fn kind(&self) -> LimitKind {
        match self {
            DenyReason::Quota { kind, .. } => (*kind).into(),
            DenyReason::FileTooLarge { .. } => LimitKind::FileSize,
            DenyReason::UnsupportedFileType { .. } => LimitKind::FileType,
            DenyReason::QueueFull { .. } => LimitKind::QueueFull,
        }
    }

    /// `(used, limit)` pair for the analytics log. File-type denials have no
    /// meaningful numbers and report zeros.
    pub(crate) fn measured(&self) -> (u64, u64) {
        match self {
            DenyReason::Quota { used, limit, .. } => (*used, *limit),
            DenyReason::FileTooLarge {
                size_bytes,
                max_bytes,
            } => (*size_bytes, *max_bytes),
            DenyReason::UnsupportedFileType { .. } => (0, 0),
            DenyReason::QueueFull {
                active_jobs,
                max_concurrent,
            } => (*active_jobs as u64, *max_concurrent as u64),
        }
    }
}

/// Outcome of a limit check. Denial is an expected result, not an error, and
/// an allowed decision cannot carry a violated limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LimitDecision {
    Allowed,
    /// A matching bypass key short-circuited the check.
    Bypassed,
    Denied(DenyReason),
}

impl LimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, LimitDecision::Allowed | LimitDecision::Bypassed)
    }

    pub fn is_bypass(&self) -> bool {
        matches!(self, LimitDecision::Bypassed)
    }

    pub fn deny_reason(&self) -> Option<&DenyReason> {
        match self {
            LimitDecision::Denied(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Usage snapshot for one tier of a quota.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TierUsage {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub percent_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
}

impl TierUsage {
    pub(crate) fn new(used: u64, limit: u64, reset_at: Option<DateTime<Utc>>) -> Self {
        Self {
            used,
            limit,
            remaining: limit.saturating_sub(used),
            percent_used: percent_used(used, limit),
            reset_at,
        }
    }
}

/// `round(used / limit * 100)`; a limit of zero reports 0% instead of
/// dividing by zero.
pub(crate) fn percent_used(used: u64, limit: u64) -> u32 {
    if limit == 0 {
        return 0;
    }
    ((used as f64 / limit as f64) * 100.0).round() as u32
}
