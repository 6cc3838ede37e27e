use crate::store::{LineFile, RecordStore};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Errors held for forwarding while the scheduler is between ticks.
const OUTBOX_CAPACITY: usize = 50;

/// An error line waiting to be published on the status channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Bounded on-disk audit trail of operational errors.
///
/// Appending never fails the caller: a broken error log is reported through
/// `tracing` only. Every recorded line is also queued in a small outbox that
/// the scheduler forwards to the broker; the oldest entries fall off when the
/// outbox is full.
pub struct ErrorLog {
    file: Option<Mutex<LineFile>>,
    max_lines: usize,
    outbox: Mutex<VecDeque<ErrorEvent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ErrorLog {
    pub fn open(path: &Path, max_lines: usize) -> Result<Self> {
        let mut file = LineFile::open(path)?;
        file.trim_to_last(max_lines)?;
        Ok(Self {
            file: Some(Mutex::new(file)),
            max_lines,
            outbox: Mutex::new(VecDeque::new()),
        })
    }

    /// An error log with no backing file; lines still reach `tracing` and the outbox.
    pub fn tracing_only(max_lines: usize) -> Self {
        Self {
            file: None,
            max_lines,
            outbox: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!("{message}");
        let now = Utc::now();

        {
            let mut outbox = lock(&self.outbox);
            if outbox.len() >= OUTBOX_CAPACITY {
                outbox.pop_front();
            }
            outbox.push_back(ErrorEvent {
                timestamp: now,
                message: message.to_string(),
            });
        }

        let Some(file) = &self.file else {
            return;
        };
        let line = format!(
            "[{}] {}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            message
        );
        let mut file = lock(file);
        if let Err(err) = file.append(line.as_bytes()) {
            tracing::warn!(error = %err, path = %file.path().display(), "error log append failed");
            return;
        }
        if let Err(err) = file.trim_to_last(self.max_lines) {
            tracing::warn!(error = %err, path = %file.path().display(), "error log trim failed");
        }
    }

    /// Drains the outbox, oldest first.
    pub fn take_pending(&self) -> Vec<ErrorEvent> {
        lock(&self.outbox).drain(..).collect()
    }

    #[cfg(test)]
    pub fn lines(&self) -> Vec<String> {
        let Some(file) = &self.file else {
            return Vec::new();
        };
        let mut file = file.lock().unwrap();
        file.records()
            .unwrap()
            .into_iter()
            .map(|record| String::from_utf8(record.body.to_vec()).unwrap())
            .collect()
    }
}
