use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// Every threshold comes from a named environment variable with a documented
// default. Malformed values silently fall back to the default; loading never
// fails.

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| match v.trim() {
            "1" => Some(true),
            "0" => Some(false),
            other => other.parse().ok(),
        })
        .unwrap_or(default)
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_csv(name: &str, default: fn() -> Vec<String>) -> Vec<String> {
    match std::env::var(name) {
        Ok(raw) => {
            let values: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if values.is_empty() {
                default()
            } else {
                values
            }
        }
        Err(_) => default(),
    }
}

/// Token quotas per evaluation tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLimitsConfig {
    #[serde(default = "default_tokens_per_request")]
    pub tokens_per_request: u64,
    #[serde(default = "default_tokens_per_session")]
    pub tokens_per_session: u64,
    #[serde(default = "default_tokens_per_day")]
    pub tokens_per_day: u64,
    #[serde(default = "default_tokens_per_month")]
    pub tokens_per_month: u64,
}

fn default_tokens_per_request() -> u64 {
    4000
}

fn default_tokens_per_session() -> u64 {
    20_000
}

fn default_tokens_per_day() -> u64 {
    50_000
}

fn default_tokens_per_month() -> u64 {
    500_000
}

impl Default for TokenLimitsConfig {
    fn default() -> Self {
        Self {
            tokens_per_request: default_tokens_per_request(),
            tokens_per_session: default_tokens_per_session(),
            tokens_per_day: default_tokens_per_day(),
            tokens_per_month: default_tokens_per_month(),
        }
    }
}

impl TokenLimitsConfig {
    fn from_env() -> Self {
        Self {
            tokens_per_request: env_u64(
                "LEXGATE_TOKENS_PER_REQUEST",
                default_tokens_per_request(),
            ),
            tokens_per_session: env_u64(
                "LEXGATE_TOKENS_PER_SESSION",
                default_tokens_per_session(),
            ),
            tokens_per_day: env_u64("LEXGATE_TOKENS_PER_DAY", default_tokens_per_day()),
            tokens_per_month: env_u64("LEXGATE_TOKENS_PER_MONTH", default_tokens_per_month()),
        }
    }
}

/// OCR page/document quotas, file acceptance rules, and the concurrency cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrLimitsConfig {
    #[serde(default = "default_max_file_size_bytes")]
    pub max_file_size_bytes: u64,
    #[serde(default = "default_max_pages_per_document")]
    pub max_pages_per_document: u64,
    #[serde(default = "default_max_pages_per_session")]
    pub max_pages_per_session: u64,
    #[serde(default = "default_max_documents_per_session")]
    pub max_documents_per_session: u64,
    #[serde(default = "default_max_pages_per_day")]
    pub max_pages_per_day: u64,
    #[serde(default = "default_max_documents_per_day")]
    pub max_documents_per_day: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_max_file_size_bytes() -> u64 {
    5 * 1024 * 1024
}

fn default_max_pages_per_document() -> u64 {
    10
}

fn default_max_pages_per_session() -> u64 {
    30
}

fn default_max_documents_per_session() -> u64 {
    5
}

fn default_max_pages_per_day() -> u64 {
    100
}

fn default_max_documents_per_day() -> u64 {
    20
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_processing_timeout_secs() -> u64 {
    300
}

fn default_allowed_mime_types() -> Vec<String> {
    vec![
        "application/pdf".to_string(),
        "image/png".to_string(),
        "image/jpeg".to_string(),
        "image/webp".to_string(),
    ]
}

impl Default for OcrLimitsConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: default_max_file_size_bytes(),
            max_pages_per_document: default_max_pages_per_document(),
            max_pages_per_session: default_max_pages_per_session(),
            max_documents_per_session: default_max_documents_per_session(),
            max_pages_per_day: default_max_pages_per_day(),
            max_documents_per_day: default_max_documents_per_day(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            processing_timeout_secs: default_processing_timeout_secs(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

impl OcrLimitsConfig {
    fn from_env() -> Self {
        Self {
            max_file_size_bytes: env_u64(
                "LEXGATE_OCR_MAX_FILE_SIZE_BYTES",
                default_max_file_size_bytes(),
            ),
            max_pages_per_document: env_u64(
                "LEXGATE_OCR_MAX_PAGES_PER_DOCUMENT",
                default_max_pages_per_document(),
            ),
            max_pages_per_session: env_u64(
                "LEXGATE_OCR_MAX_PAGES_PER_SESSION",
                default_max_pages_per_session(),
            ),
            max_documents_per_session: env_u64(
                "LEXGATE_OCR_MAX_DOCUMENTS_PER_SESSION",
                default_max_documents_per_session(),
            ),
            max_pages_per_day: env_u64(
                "LEXGATE_OCR_MAX_PAGES_PER_DAY",
                default_max_pages_per_day(),
            ),
            max_documents_per_day: env_u64(
                "LEXGATE_OCR_MAX_DOCUMENTS_PER_DAY",
                default_max_documents_per_day(),
            ),
            max_concurrent_jobs: env_usize(
                "LEXGATE_OCR_MAX_CONCURRENT_JOBS",
                default_max_concurrent_jobs(),
            ),
            processing_timeout_secs: env_u64(
                "LEXGATE_OCR_PROCESSING_TIMEOUT_SECS",
                default_processing_timeout_secs(),
            ),
            allowed_mime_types: env_csv(
                "LEXGATE_OCR_ALLOWED_MIME_TYPES",
                default_allowed_mime_types,
            ),
        }
    }

    pub fn is_mime_type_allowed(&self, mime_type: &str) -> bool {
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(mime_type))
    }
}

/// Short-window request-rate thresholds, independent of the token/page
/// quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    #[serde(default = "default_requests_per_day")]
    pub requests_per_day: u32,
}

fn default_true() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    20
}

fn default_requests_per_hour() -> u32 {
    300
}

fn default_requests_per_day() -> u32 {
    2000
}

impl Default for RequestRateConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            requests_per_minute: default_requests_per_minute(),
            requests_per_hour: default_requests_per_hour(),
            requests_per_day: default_requests_per_day(),
        }
    }
}

impl RequestRateConfig {
    fn from_env() -> Self {
        Self {
            enabled: env_bool("LEXGATE_RATE_LIMIT_ENABLED", default_true()),
            requests_per_minute: env_u32(
                "LEXGATE_REQUESTS_PER_MINUTE",
                default_requests_per_minute(),
            ),
            requests_per_hour: env_u32("LEXGATE_REQUESTS_PER_HOUR", default_requests_per_hour()),
            requests_per_day: env_u32("LEXGATE_REQUESTS_PER_DAY", default_requests_per_day()),
        }
    }
}

/// Shared secrets that short-circuit limit checks when matched exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BypassConfig {
    #[serde(default)]
    pub admin_key: Option<String>,
    #[serde(default = "default_true")]
    pub bypass_enabled: bool,
    #[serde(default)]
    pub ocr_bypass_key: Option<String>,
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            admin_key: None,
            bypass_enabled: default_true(),
            ocr_bypass_key: None,
        }
    }
}

impl BypassConfig {
    fn from_env() -> Self {
        Self {
            admin_key: env_opt_string("LEXGATE_ADMIN_KEY"),
            bypass_enabled: env_bool("LEXGATE_BYPASS_ENABLED", default_true()),
            ocr_bypass_key: env_opt_string("LEXGATE_OCR_BYPASS_KEY"),
        }
    }

    /// Exact match against the configured admin key. A mismatch is
    /// indistinguishable from an unconfigured key, so callers cannot probe
    /// for key validity.
    pub fn matches_admin(&self, candidate: Option<&str>) -> bool {
        self.matches(self.admin_key.as_deref(), candidate)
    }

    /// The OCR engine uses its own key; the admin key does not carry over.
    pub fn matches_ocr(&self, candidate: Option<&str>) -> bool {
        self.matches(self.ocr_bypass_key.as_deref(), candidate)
    }

    fn matches(&self, configured: Option<&str>, candidate: Option<&str>) -> bool {
        if !self.bypass_enabled {
            return false;
        }
        match (configured, candidate) {
            (Some(key), Some(candidate)) if !key.is_empty() => key == candidate,
            _ => false,
        }
    }
}

/// Retention windows for the background cleanup sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Sessions idle longer than this are evicted.
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
    /// Terminal OCR jobs older than this are purged from the registry.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_session_idle_secs() -> u64 {
    24 * 60 * 60
}

fn default_job_retention_secs() -> u64 {
    60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            session_idle_secs: default_session_idle_secs(),
            job_retention_secs: default_job_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CleanupConfig {
    fn from_env() -> Self {
        Self {
            session_idle_secs: env_u64("LEXGATE_SESSION_IDLE_SECS", default_session_idle_secs()),
            job_retention_secs: env_u64(
                "LEXGATE_JOB_RETENTION_SECS",
                default_job_retention_secs(),
            ),
            sweep_interval_secs: env_u64(
                "LEXGATE_SWEEP_INTERVAL_SECS",
                default_sweep_interval_secs(),
            ),
        }
    }
}

/// One immutable snapshot of every threshold and flag the engines consult.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub tokens: TokenLimitsConfig,
    #[serde(default)]
    pub ocr: OcrLimitsConfig,
    #[serde(default)]
    pub rate: RequestRateConfig,
    #[serde(default)]
    pub bypass: BypassConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl LimitsConfig {
    pub fn from_env() -> Self {
        Self {
            tokens: TokenLimitsConfig::from_env(),
            ocr: OcrLimitsConfig::from_env(),
            rate: RequestRateConfig::from_env(),
            bypass: BypassConfig::from_env(),
            cleanup: CleanupConfig::from_env(),
        }
    }
}

/// Cloneable handle to the current config snapshot.
///
/// Engines call `load()` once at the top of each check, so a concurrent
/// `refresh()` takes effect for subsequent checks only and never tears a
/// check in progress.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<LimitsConfig>>,
}

impl ConfigHandle {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn from_env() -> Self {
        Self::new(LimitsConfig::from_env())
    }

    pub fn load(&self) -> Arc<LimitsConfig> {
        self.inner.load_full()
    }

    /// Re-reads the environment and replaces the snapshot.
    pub fn refresh(&self) {
        self.inner.store(Arc::new(LimitsConfig::from_env()));
        debug!("refreshed limits configuration from environment");
    }

    /// Replaces the snapshot directly (admin overrides, tests).
    pub fn replace(&self, config: LimitsConfig) {
        self.inner.store(Arc::new(config));
    }
}
