use crate::analytics::LimitAnalytics;
use crate::config::{ConfigHandle, LimitsConfig};
use crate::decision::{DenyReason, LimitDecision, QuotaKind, TierUsage};
use crate::identity::Identity;
use crate::store::UsageStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Read-only snapshot of all four token tiers, lazy rollover applied.
#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageStats {
    /// Per-request ceiling; not cumulative, so there is no `used` to report.
    pub per_request_limit: u64,
    pub session: TierUsage,
    pub daily: TierUsage,
    pub monthly: TierUsage,
}

/// Token quota engine.
///
/// Checks run against an estimate (input tokens plus a fixed output buffer)
/// before the expensive LLM call; tracking records the actual post-call
/// total. The gate is conservative, the stored usage is exact, and usage is
/// never charged for denied or failed requests.
pub struct TokenLimitEngine {
    config: ConfigHandle,
    store: Arc<dyn UsageStore>,
    analytics: Arc<LimitAnalytics>,
}

impl TokenLimitEngine {
    pub fn new(
        config: ConfigHandle,
        store: Arc<dyn UsageStore>,
        analytics: Arc<LimitAnalytics>,
    ) -> Self {
        Self {
            config,
            store,
            analytics,
        }
    }

    /// Evaluates, in order: admin bypass, per-request ceiling, session
    /// cumulative, daily cumulative, monthly cumulative. The first violated
    /// tier wins.
    pub fn check(
        &self,
        identity: &Identity,
        estimated_tokens: u64,
        bypass_key: Option<&str>,
    ) -> LimitDecision {
        self.check_at(identity, estimated_tokens, bypass_key, Utc::now())
    }

    pub(crate) fn check_at(
        &self,
        identity: &Identity,
        estimated_tokens: u64,
        bypass_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> LimitDecision {
        // One snapshot per check: a concurrent refresh applies to later
        // checks only.
        let config = self.config.load();
        if config.bypass.matches_admin(bypass_key) {
            debug!(user_id = %identity.user_id, "admin bypass for token check");
            return LimitDecision::Bypassed;
        }

        let limits = &config.tokens;
        if estimated_tokens > limits.tokens_per_request {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::PerRequest,
                    limits.tokens_per_request,
                    estimated_tokens,
                    None,
                ),
            );
        }

        let session_used = self
            .store
            .session(&identity.session_id)
            .map(|s| s.tokens)
            .unwrap_or(0);
        if session_used + estimated_tokens > limits.tokens_per_session {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::Session,
                    limits.tokens_per_session,
                    session_used,
                    None,
                ),
            );
        }

        let daily = self.store.daily(&identity.user_id, now);
        if daily.tokens_today + estimated_tokens > limits.tokens_per_day {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::Daily,
                    limits.tokens_per_day,
                    daily.tokens_today,
                    Some(daily.daily_reset_at),
                ),
            );
        }
        if daily.tokens_this_month + estimated_tokens > limits.tokens_per_month {
            return self.deny(
                identity,
                DenyReason::quota(
                    QuotaKind::Monthly,
                    limits.tokens_per_month,
                    daily.tokens_this_month,
                    Some(daily.monthly_reset_at),
                ),
            );
        }

        LimitDecision::Allowed
    }

    /// Records the actual post-call token total against the session, daily,
    /// and monthly counters. Unconditional: call exactly once per successful
    /// downstream request.
    pub fn track(&self, identity: &Identity, actual_tokens: u64) {
        self.track_at(identity, actual_tokens, Utc::now());
    }

    pub(crate) fn track_at(&self, identity: &Identity, actual_tokens: u64, now: DateTime<Utc>) {
        self.store
            .update_session(&identity.session_id, now, &mut |session| {
                session.tokens += actual_tokens;
            });
        self.store.update_daily(&identity.user_id, now, &mut |daily| {
            daily.tokens_today += actual_tokens;
            daily.tokens_this_month += actual_tokens;
        });
        debug!(
            user_id = %identity.user_id,
            session_id = %identity.session_id,
            actual_tokens,
            "tracked token usage"
        );
    }

    pub fn usage_stats(&self, identity: &Identity) -> TokenUsageStats {
        self.usage_stats_at(identity, Utc::now())
    }

    pub(crate) fn usage_stats_at(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> TokenUsageStats {
        let config = self.config.load();
        let limits = &config.tokens;
        let session_used = self
            .store
            .session(&identity.session_id)
            .map(|s| s.tokens)
            .unwrap_or(0);
        let daily = self.store.daily(&identity.user_id, now);

        TokenUsageStats {
            per_request_limit: limits.tokens_per_request,
            session: TierUsage::new(session_used, limits.tokens_per_session, None),
            daily: TierUsage::new(
                daily.tokens_today,
                limits.tokens_per_day,
                Some(daily.daily_reset_at),
            ),
            monthly: TierUsage::new(
                daily.tokens_this_month,
                limits.tokens_per_month,
                Some(daily.monthly_reset_at),
            ),
        }
    }

    /// Deletes the session record ("clear chat").
    pub fn reset_session(&self, session_id: &str) -> bool {
        self.store.remove_session(session_id).is_some()
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
            "token limit denied"
        );
        LimitDecision::Denied(reason)
    }
}
