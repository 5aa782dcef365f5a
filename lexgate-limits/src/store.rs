use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let next_day = now
        .date_naive()
        .succ_opt()
        .unwrap_or_else(|| now.date_naive());
    Utc.from_utc_datetime(&next_day.and_time(NaiveTime::MIN))
}

fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_else(|| now.date_naive());
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

/// Per-user counters with time-boxed windows.
///
/// Rollover is lazy: the record keeps accumulating until the next read after
/// its reset timestamp, at which point [`UserDailyUsage::normalize`] zeroes
/// the expired window and advances the boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserDailyUsage {
    pub tokens_today: u64,
    pub tokens_this_month: u64,
    pub ocr_pages_today: u64,
    pub ocr_documents_today: u64,
    /// Next UTC midnight after the last daily reset.
    pub daily_reset_at: DateTime<Utc>,
    /// First of the next month, UTC.
    pub monthly_reset_at: DateTime<Utc>,
}

impl UserDailyUsage {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tokens_today: 0,
            tokens_this_month: 0,
            ocr_pages_today: 0,
            ocr_documents_today: 0,
            daily_reset_at: next_utc_midnight(now),
            monthly_reset_at: next_month_start(now),
        }
    }

    /// Applies lazy rollover. Every accessor calls this first, so no call
    /// site re-implements the boundary check.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        if now >= self.daily_reset_at {
            self.tokens_today = 0;
            self.ocr_pages_today = 0;
            self.ocr_documents_today = 0;
            self.daily_reset_at = next_utc_midnight(now);
        }
        if now >= self.monthly_reset_at {
            self.tokens_this_month = 0;
            self.monthly_reset_at = next_month_start(now);
        }
    }
}

/// Per-session counters. Sessions carry no rollover; they live until reset
/// or until the idle sweep evicts them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionUsage {
    pub tokens: u64,
    pub ocr_pages: u64,
    pub ocr_documents: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl SessionUsage {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            tokens: 0,
            ocr_pages: 0,
            ocr_documents: 0,
            created_at: now,
            last_activity: now,
        }
    }
}

/// Keyed usage state behind a trait, so the in-memory implementation can be
/// swapped for a shared external store in a multi-instance deployment.
///
/// Mutating operations must be atomic per key: the closure runs while the
/// implementation holds whatever lock covers that record. The window between
/// a check (read) and a track (write) spans the caller's external work and
/// is intentionally not closed here — concurrent requests can both pass a
/// check that, combined, exceeds the limit. Accepted as a soft limit.
pub trait UsageStore: Send + Sync {
    /// Normalized snapshot of the user's daily record, creating it on first
    /// access.
    fn daily(&self, user_id: &str, now: DateTime<Utc>) -> UserDailyUsage;

    /// Atomic read-modify-write on the user's daily record. The record is
    /// normalized before `apply` runs.
    fn update_daily(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut UserDailyUsage),
    );

    /// Snapshot of a session, if one exists. Read-only; does not refresh
    /// `last_activity`.
    fn session(&self, session_id: &str) -> Option<SessionUsage>;

    /// Atomic read-modify-write on a session record, creating it when
    /// absent. Always refreshes `last_activity`.
    fn update_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut SessionUsage),
    );

    fn remove_session(&self, session_id: &str) -> Option<SessionUsage>;

    /// Evicts sessions whose `last_activity` is at least `idle_for` in the
    /// past. Returns the number evicted.
    fn sweep_idle_sessions(&self, now: DateTime<Utc>, idle_for: Duration) -> usize;
}

/// In-memory store. DashMap gives per-shard locking, so each per-key
/// read-modify-write is atomic under parallel request handling.
#[derive(Debug, Default)]
pub struct MemoryUsageStore {
    daily: DashMap<String, UserDailyUsage>,
    sessions: DashMap<String, SessionUsage>,
}

impl MemoryUsageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UsageStore for MemoryUsageStore {
    fn daily(&self, user_id: &str, now: DateTime<Utc>) -> UserDailyUsage {
        let mut entry = self
            .daily
            .entry(user_id.to_string())
            .or_insert_with(|| UserDailyUsage::new(now));
        entry.normalize(now);
        entry.value().clone()
    }

    fn update_daily(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut UserDailyUsage),
    ) {
        let mut entry = self
            .daily
            .entry(user_id.to_string())
            .or_insert_with(|| UserDailyUsage::new(now));
        entry.normalize(now);
        apply(&mut entry);
    }

    fn session(&self, session_id: &str) -> Option<SessionUsage> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    fn update_session(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        apply: &mut dyn FnMut(&mut SessionUsage),
    ) {
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionUsage::new(now));
        apply(&mut entry);
        entry.last_activity = now;
    }

    fn remove_session(&self, session_id: &str) -> Option<SessionUsage> {
        self.sessions.remove(session_id).map(|(_, usage)| usage)
    }

    fn sweep_idle_sessions(&self, now: DateTime<Utc>, idle_for: Duration) -> usize {
        let cutoff = now - idle_for;
        // Counted inside the closure: inserts landing while `retain` walks
        // the shards would skew a before/after length comparison.
        let mut evicted = 0;
        self.sessions.retain(|_, usage| {
            if usage.last_activity > cutoff {
                true
            } else {
                evicted += 1;
                false
            }
        });
        if evicted > 0 {
            debug!(evicted, "evicted idle sessions");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_daily_rollover_is_exact_at_midnight() {
        let store = MemoryUsageStore::new();
        let evening = at("2026-03-14T23:00:00Z");
        store.update_daily("u1", evening, &mut |d| {
            d.tokens_today += 500;
            d.tokens_this_month += 500;
        });

        // 1ms before midnight: yesterday's value still visible.
        let before = store.daily("u1", at("2026-03-14T23:59:59.999Z"));
        assert_eq!(before.tokens_today, 500);

        // At the boundary the window is zeroed and advanced.
        let after = store.daily("u1", at("2026-03-15T00:00:00.001Z"));
        assert_eq!(after.tokens_today, 0);
        assert_eq!(after.daily_reset_at, at("2026-03-16T00:00:00Z"));
        // Monthly window is untouched by a daily rollover.
        assert_eq!(after.tokens_this_month, 500);
    }

    #[test]
    fn test_monthly_rollover_across_year_boundary() {
        let store = MemoryUsageStore::new();
        let december = at("2026-12-31T12:00:00Z");
        store.update_daily("u1", december, &mut |d| d.tokens_this_month += 900);

        let snapshot = store.daily("u1", december);
        assert_eq!(snapshot.monthly_reset_at, at("2027-01-01T00:00:00Z"));

        let january = store.daily("u1", at("2027-01-01T00:00:00Z"));
        assert_eq!(january.tokens_this_month, 0);
        assert_eq!(january.monthly_reset_at, at("2027-02-01T00:00:00Z"));
    }

    #[test]
    fn test_rollover_after_long_gap_lands_on_current_boundary() {
        let store = MemoryUsageStore::new();
        store.update_daily("u1", at("2026-01-01T10:00:00Z"), &mut |d| {
            d.ocr_pages_today += 7;
        });

        // Weeks later: reset applies once and the boundary is relative to
        // the read time, not the stale one.
        let later = store.daily("u1", at("2026-02-20T05:00:00Z"));
        assert_eq!(later.ocr_pages_today, 0);
        assert_eq!(later.daily_reset_at, at("2026-02-21T00:00:00Z"));
        assert_eq!(later.monthly_reset_at, at("2026-03-01T00:00:00Z"));
    }

    #[test]
    fn test_update_session_refreshes_last_activity() {
        let store = MemoryUsageStore::new();
        let t0 = at("2026-03-14T10:00:00Z");
        let t1 = at("2026-03-14T11:00:00Z");
        store.update_session("s1", t0, &mut |s| s.tokens += 10);
        store.update_session("s1", t1, &mut |s| s.tokens += 5);

        let session = store.session("s1").unwrap();
        assert_eq!(session.tokens, 15);
        assert_eq!(session.created_at, t0);
        assert_eq!(session.last_activity, t1);
    }

    #[test]
    fn test_sweep_evicts_only_idle_sessions() {
        let store = MemoryUsageStore::new();
        let old = at("2026-03-13T09:00:00Z");
        let fresh = at("2026-03-14T08:30:00Z");
        store.update_session("stale", old, &mut |_| {});
        store.update_session("active", fresh, &mut |_| {});

        let now = at("2026-03-14T09:00:00Z");
        let evicted = store.sweep_idle_sessions(now, Duration::hours(24));
        assert_eq!(evicted, 1);
        assert!(store.session("stale").is_none());
        assert!(store.session("active").is_some());
    }

    #[test]
    fn test_sweep_counts_correctly_under_concurrent_inserts() {
        use std::sync::Arc;

        let store = Arc::new(MemoryUsageStore::new());
        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    store.update_session(&format!("s-{i}"), Utc::now(), &mut |s| {
                        s.tokens += 1;
                    });
                }
            })
        };

        // A zero idle window makes every existing session eligible, so each
        // pass evicts while the writer keeps inserting. The count must stay
        // sane (no underflow) on every pass.
        for _ in 0..500 {
            let evicted =
                store.sweep_idle_sessions(Utc::now() + Duration::seconds(1), Duration::zero());
            assert!(evicted <= 2000);
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_remove_session_returns_final_state() {
        let store = MemoryUsageStore::new();
        let now = at("2026-03-14T10:00:00Z");
        store.update_session("s1", now, &mut |s| s.ocr_documents += 2);
        let removed = store.remove_session("s1").unwrap();
        assert_eq!(removed.ocr_documents, 2);
        assert!(store.remove_session("s1").is_none());
    }
}
