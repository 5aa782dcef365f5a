//! Usage-limiting core for the lexgate legal-document chatbot gateway.
//!
//! Library-style interface: the surrounding route handlers resolve an
//! identity from request headers, ask the engines for an allow/deny
//! decision, perform the external work (LLM call, file upload), and report
//! the actual usage back for tracking. Nothing in this crate performs I/O
//! on the request path.

pub mod analytics; // limit-hit event log and admin summaries
pub mod config; // env-derived thresholds and feature flags
pub mod decision; // allow/bypass/deny result taxonomy
pub mod error; // error handling
pub mod identity; // user/session identity pair
pub mod ocr; // OCR page/document quotas and job lifecycle
pub mod rate_limit; // short-window request throttling
pub mod store; // per-user-daily and per-session usage state
pub mod sweeper; // periodic cleanup of idle sessions and stale jobs
pub mod tokens; // token quotas per request/session/day/month

pub use analytics::{AnalyticsStats, LimitAnalytics, LimitHitEvent};
pub use config::{ConfigHandle, LimitsConfig};
pub use decision::{DenyReason, LimitDecision, LimitKind, QuotaKind, TierUsage};
pub use error::{Error, ErrorDetails};
pub use identity::Identity;
pub use ocr::{FileMetadata, JobStatus, OcrJob, OcrLimitEngine, OcrUsageStats};
pub use rate_limit::{RateLimitDecision, RateLimitStatus, RateLimiter, RateTier};
pub use store::{MemoryUsageStore, SessionUsage, UsageStore, UserDailyUsage};
pub use sweeper::CleanupSweeper;
pub use tokens::{TokenLimitEngine, TokenUsageStats};
