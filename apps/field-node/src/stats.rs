use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug)]
pub struct NodeStats {
    pub ticks: AtomicU64,
    pub last_tick_unix_ms: AtomicU64,
    pub validation_failures: AtomicU64,
    pub published: AtomicU64,
    pub deferred: AtomicU64,
    pub replayed: AtomicU64,
    pub dropped_records: AtomicU64,
    pub queue_depth: AtomicU64,
    pub averages_written: AtomicU64,
    pub broker_connected: AtomicBool,
    pub last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub ticks: u64,
    pub last_tick_unix_ms: u64,
    pub validation_failures: u64,
    pub published: u64,
    pub deferred: u64,
    pub replayed: u64,
    pub dropped_records: u64,
    pub queue_depth: u64,
    pub averages_written: u64,
    pub broker_connected: bool,
    pub last_error: Option<String>,
}

impl NodeStats {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            last_tick_unix_ms: AtomicU64::new(0),
            validation_failures: AtomicU64::new(0),
            published: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            dropped_records: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            averages_written: AtomicU64::new(0),
            broker_connected: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
        self.last_tick_unix_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn set_broker_connected(&self, connected: bool) {
        self.broker_connected.store(connected, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth as u64, Ordering::Relaxed);
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            last_tick_unix_ms: self.last_tick_unix_ms.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            dropped_records: self.dropped_records.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            averages_written: self.averages_written.load(Ordering::Relaxed),
            broker_connected: self.broker_connected.load(Ordering::Relaxed),
            last_error: self.last_error.lock().ok().and_then(|guard| guard.clone()),
        }
    }
}

impl Default for NodeStats {
    fn default() -> Self {
        Self::new()
    }
}
