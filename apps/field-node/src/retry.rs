use crate::store::{disk_usage, MemoryStore, RecordStore, SpoolFile};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, MutexGuard};

/// A record that could not be delivered and waits for a resend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub topic: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl RetryRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).context("encode retry record")
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).context("decode retry record")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub max_records: usize,
    pub keep_free_bytes: u64,
}

impl QueueLimits {
    /// Depth the queue is cut back to once it overflows. Trimming a tenth of
    /// the cap at a time keeps spool compactions rare during long outages.
    pub fn low_water(&self) -> usize {
        self.max_records - self.max_records / 10
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// Oldest records discarded to respect `max_records`.
    pub dropped: usize,
}

pub type QueueStore = Box<dyn RecordStore>;

pub struct RetryQueue {
    store: Mutex<QueueStore>,
    limits: QueueLimits,
    spool_dir: Option<PathBuf>,
}

impl RetryQueue {
    pub fn new(store: QueueStore, limits: QueueLimits, spool_dir: Option<PathBuf>) -> Self {
        Self {
            store: Mutex::new(store),
            limits,
            spool_dir,
        }
    }

    pub fn open_spool(dir: &Path, limits: QueueLimits) -> Result<Self> {
        let spool = SpoolFile::open(&dir.join("retry.spool"))
            .with_context(|| format!("open retry spool in {}", dir.display()))?;
        if !spool.is_empty() {
            tracing::info!(pending = spool.len(), "retry spool holds undelivered records");
        }
        Ok(Self::new(Box::new(spool), limits, Some(dir.to_path_buf())))
    }

    pub fn in_memory(limits: QueueLimits) -> Self {
        Self::new(Box::new(MemoryStore::new()), limits, None)
    }

    pub async fn enqueue(&self, record: &RetryRecord) -> Result<EnqueueOutcome> {
        let body = record.encode()?;
        if let Some(dir) = &self.spool_dir {
            if self.limits.keep_free_bytes > 0 {
                let free = disk_usage(dir)?.free_bytes;
                if free < self.limits.keep_free_bytes {
                    return Err(anyhow!(
                        "spool filesystem has {free} bytes free, below floor of {}",
                        self.limits.keep_free_bytes
                    ));
                }
            }
        }

        let mut store = self.store.lock().await;
        store.append(&body)?;
        let dropped = if store.len() > self.limits.max_records {
            store.trim_to_last(self.limits.low_water())?
        } else {
            0
        };
        Ok(EnqueueOutcome { dropped })
    }

    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    /// Exclusive access for a drain pass. Callers holding the broker link lock
    /// take it first; the queue lock always comes second.
    pub async fn lock(&self) -> MutexGuard<'_, QueueStore> {
        self.store.lock().await
    }
}
