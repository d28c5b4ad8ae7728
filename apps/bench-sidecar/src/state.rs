use crate::ingest::{IngestOutcome, LivenessTracker};
use crate::session::{Session, Summary};
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

/// Everything the ingestor and the session controller mutate.
///
/// Session status and buffers share one lock: an ingest that observes
/// `running` appends before any transition can complete, and a transition
/// that has taken the lock wins over every later sample.
#[derive(Debug)]
pub(crate) struct EngineState {
    pub(crate) session: Option<Session>,
    pub(crate) last_summary: Option<Arc<Summary>>,
    pub(crate) liveness: LivenessTracker,
}

impl EngineState {
    pub(crate) fn new(stale_after: ChronoDuration) -> Self {
        Self {
            session: None,
            last_summary: None,
            liveness: LivenessTracker::new(stale_after),
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<EngineState>>;

pub(crate) fn shared(stale_after: std::time::Duration) -> SharedState {
    let stale_after = ChronoDuration::from_std(stale_after)
        .unwrap_or_else(|_| ChronoDuration::milliseconds(1500));
    Arc::new(Mutex::new(EngineState::new(stale_after)))
}

#[derive(Debug)]
pub struct EngineStats {
    pub samples_appended: AtomicU64,
    pub samples_overwritten: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub mqtt_connected: AtomicBool,
    pub summaries_exported: AtomicU64,
    pub export_queue_depth: AtomicU64,
    pub last_export_unix_ms: AtomicU64,
    pub last_error: StdMutex<Option<String>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            samples_appended: AtomicU64::new(0),
            samples_overwritten: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            summaries_exported: AtomicU64::new(0),
            export_queue_depth: AtomicU64::new(0),
            last_export_unix_ms: AtomicU64::new(0),
            last_error: StdMutex::new(None),
        }
    }

    pub fn record_outcome(&self, outcome: IngestOutcome) {
        let counter = match outcome {
            IngestOutcome::Appended => &self.samples_appended,
            IngestOutcome::Overwritten => &self.samples_overwritten,
            IngestOutcome::Dropped(_) => &self.samples_dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}
