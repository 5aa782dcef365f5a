use crate::decision::{DenyReason, LimitKind};
use crate::error::{Error, ErrorDetails};
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

const DEFAULT_CAPACITY: usize = 1000;
const RECENT_LIMIT: usize = 50;

/// One denied limit check.
#[derive(Debug, Clone, Serialize)]
pub struct LimitHitEvent {
    pub at: DateTime<Utc>,
    pub user_id: String,
    pub session_id: String,
    pub kind: LimitKind,
    pub used: u64,
    pub limit: u64,
}

/// Aggregated view served to the admin panel.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsStats {
    pub hits_today: usize,
    /// Most recent hits, newest first.
    pub recent: Vec<LimitHitEvent>,
}

/// Append-only log of limit-hit events, bounded to the most recent entries.
///
/// Purely observational: the engines write to it on every denial, but it
/// never influences an allow/deny decision.
#[derive(Debug)]
pub struct LimitAnalytics {
    events: Mutex<VecDeque<LimitHitEvent>>,
    capacity: usize,
}

impl Default for LimitAnalytics {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LimitAnalytics {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn record_hit(&self, event: LimitHitEvent) {
        let mut events = self.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub(crate) fn record_denial(&self, identity: &Identity, reason: &DenyReason) {
        let (used, limit) = reason.measured();
        self.record_hit(LimitHitEvent {
            at: Utc::now(),
            user_id: identity.user_id.clone(),
            session_id: identity.session_id.clone(),
            kind: reason.kind(),
            used,
            limit,
        });
    }

    pub fn stats(&self) -> AnalyticsStats {
        self.stats_at(Utc::now())
    }

    pub(crate) fn stats_at(&self, now: DateTime<Utc>) -> AnalyticsStats {
        let events = self.lock();
        let today = now.date_naive();
        let hits_today = events
            .iter()
            .filter(|event| event.at.date_naive() == today)
            .count();
        let recent = events
            .iter()
            .rev()
            .take(RECENT_LIMIT)
            .cloned()
            .collect();
        AnalyticsStats { hits_today, recent }
    }

    /// Admin action: drops every recorded event.
    pub fn clear(&self) {
        let cleared = {
            let mut events = self.lock();
            let cleared = events.len();
            events.clear();
            cleared
        };
        debug!(cleared, "cleared limit analytics log");
    }

    pub fn export_json(&self) -> Result<String, Error> {
        serde_json::to_string(&self.stats()).map_err(|e| {
            Error::new(ErrorDetails::Serialization {
                message: e.to_string(),
            })
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LimitHitEvent>> {
        // Recording analytics must never take the process down; a poisoned
        // lock still holds a structurally valid log.
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
