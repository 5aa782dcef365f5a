use crate::config::ConfigHandle;
use crate::identity::Identity;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use tracing::debug;

/// Request-rate tier, resolved by the caller from its auth layer. The tier
/// scales the configured base limits; it never disables them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RateTier {
    Standard,
    Premium,
    Internal,
}

impl RateTier {
    pub fn multiplier(self) -> u32 {
        match self {
            RateTier::Standard => 1,
            RateTier::Premium => 5,
            RateTier::Internal => 20,
        }
    }
}

/// Snapshot of the tightest window at decision time. On a denial this is the
/// violated window and `retry_after_secs` says how long until it opens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allow(RateLimitStatus),
    Deny(RateLimitStatus),
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allow(_))
    }

    pub fn status(&self) -> &RateLimitStatus {
        match self {
            RateLimitDecision::Allow(status) | RateLimitDecision::Deny(status) => status,
        }
    }
}

/// One fixed window. The window is anchored at the first request after each
/// rollover, and rolls over lazily on the next touch past its boundary.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    resets_at: DateTime<Utc>,
}

impl Window {
    fn new(now: DateTime<Utc>, length: Duration) -> Self {
        Self {
            count: 0,
            resets_at: now + length,
        }
    }

    fn normalize(&mut self, now: DateTime<Utc>, length: Duration) {
        if now >= self.resets_at {
            self.count = 0;
            self.resets_at = now + length;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindows {
    minute: Window,
    hour: Window,
    day: Window,
}

impl RateWindows {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute: Window::new(now, Duration::minutes(1)),
            hour: Window::new(now, Duration::hours(1)),
            day: Window::new(now, Duration::days(1)),
        }
    }

    fn normalize(&mut self, now: DateTime<Utc>) {
        self.minute.normalize(now, Duration::minutes(1));
        self.hour.normalize(now, Duration::hours(1));
        self.day.normalize(now, Duration::days(1));
    }
}

/// Short-window request throttle, independent of the token and OCR quota
/// state. `check` only reads; `record` is called after the request has
/// actually been served, so denied or failed requests never consume budget.
pub struct RateLimiter {
    config: ConfigHandle,
    windows: DashMap<String, RateWindows>,
}

impl RateLimiter {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, identity: &Identity, tier: RateTier) -> RateLimitDecision {
        self.check_at(identity, tier, Utc::now())
    }

    pub(crate) fn check_at(
        &self,
        identity: &Identity,
        tier: RateTier,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let config = self.config.load();
        if !config.rate.enabled {
            return RateLimitDecision::Allow(RateLimitStatus {
                limit: 0,
                remaining: 0,
                resets_at: now,
                retry_after_secs: None,
            });
        }

        let multiplier = tier.multiplier();
        let mut entry = self
            .windows
            .entry(identity.user_id.clone())
            .or_insert_with(|| RateWindows::new(now));
        entry.normalize(now);

        // Minute, then hour, then day; the first exhausted window denies.
        let windows = [
            (entry.minute, config.rate.requests_per_minute),
            (entry.hour, config.rate.requests_per_hour),
            (entry.day, config.rate.requests_per_day),
        ];
        drop(entry);

        let mut tightest: Option<RateLimitStatus> = None;
        for (window, base_limit) in windows {
            let limit = base_limit.saturating_mul(multiplier);
            let remaining = limit.saturating_sub(window.count);
            if window.count >= limit {
                let retry_after = (window.resets_at - now).num_seconds().max(0) as u64;
                debug!(
                    user_id = %identity.user_id,
                    tier = %tier,
                    limit,
                    "rate limit exceeded"
                );
                return RateLimitDecision::Deny(RateLimitStatus {
                    limit,
                    remaining: 0,
                    resets_at: window.resets_at,
                    retry_after_secs: Some(retry_after),
                });
            }
            if tightest.is_none_or(|t| remaining < t.remaining) {
                tightest = Some(RateLimitStatus {
                    limit,
                    remaining,
                    resets_at: window.resets_at,
                    retry_after_secs: None,
                });
            }
        }

        // The array above is never empty, so `tightest` is always set.
        RateLimitDecision::Allow(tightest.unwrap_or(RateLimitStatus {
            limit: 0,
            remaining: 0,
            resets_at: now,
            retry_after_secs: None,
        }))
    }

    /// Counts one served request against every window. Call after the
    /// request succeeds, never from `check`.
    pub fn record(&self, identity: &Identity) {
        self.record_at(identity, Utc::now());
    }

    pub(crate) fn record_at(&self, identity: &Identity, now: DateTime<Utc>) {
        let mut entry = self
            .windows
            .entry(identity.user_id.clone())
            .or_insert_with(|| RateWindows::new(now));
        entry.normalize(now);
        entry.minute.count += 1;
        entry.hour.count += 1;
        entry.day.count += 1;
    }

    /// Drops every tracked window (admin reset).
    pub fn clear(&self) {
        self.windows.clear();
    }
}
