use crate::config::ConfigHandle;
use crate::error::{Error, ErrorDetails};
use crate::ocr::OcrLimitEngine;
use crate::store::UsageStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Periodic cleanup of state that request handling never removes on its own:
/// idle sessions, terminal OCR jobs past retention, and processing jobs
/// stuck past the timeout.
///
/// Every pass uses the same per-key entry locking as the request path, so it
/// is safe to run while requests mutate the store.
pub struct CleanupSweeper {
    config: ConfigHandle,
    store: Arc<dyn UsageStore>,
    ocr: Arc<OcrLimitEngine>,
    handle: RwLock<Option<JoinHandle<()>>>,
}

impl CleanupSweeper {
    pub fn new(config: ConfigHandle, store: Arc<dyn UsageStore>, ocr: Arc<OcrLimitEngine>) -> Self {
        Self {
            config,
            store,
            ocr,
            handle: RwLock::new(None),
        }
    }

    /// Spawns the sweep loop at the configured interval. The interval is
    /// read once at startup; call `stop`/`start` to pick up a new value.
    pub async fn start(&self) -> Result<(), Error> {
        let mut handle = self.handle.write().await;
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return Err(Error::new(ErrorDetails::SweeperAlreadyRunning));
        }

        let interval_secs = self.config.load().cleanup.sweep_interval_secs.max(1);
        let config = self.config.clone();
        let store = Arc::clone(&self.store);
        let ocr = Arc::clone(&self.ocr);
        info!(interval_secs, "starting cleanup sweeper");

        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                sweep_once(&config, store.as_ref(), &ocr, Utc::now());
            }
        }));
        Ok(())
    }

    pub async fn stop(&self) {
        let mut handle = self.handle.write().await;
        if let Some(task) = handle.take() {
            task.abort();
            info!("stopped cleanup sweeper");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.handle
            .read()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// One synchronous pass, outside the spawned loop (admin endpoint,
    /// shutdown drain).
    pub fn sweep_now(&self) {
        sweep_once(&self.config, self.store.as_ref(), &self.ocr, Utc::now());
    }
}

fn sweep_once(
    config: &ConfigHandle,
    store: &dyn UsageStore,
    ocr: &OcrLimitEngine,
    now: DateTime<Utc>,
) {
    let snapshot = config.load();
    let evicted = store.sweep_idle_sessions(
        now,
        chrono::Duration::seconds(snapshot.cleanup.session_idle_secs as i64),
    );
    let (purged, timed_out) = ocr.sweep_jobs_at(now);
    debug!(evicted, purged, timed_out, "cleanup sweep pass finished");
}
