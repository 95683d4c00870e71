//! Regression notifications.
//!
//! Sinks run after the append has committed. A failing sink is logged by the
//! caller and never affects stored history.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::detect::{Baseline, Evaluation, Verdict};
use crate::store::SeriesEntry;
use crate::{BenchError, Commit, Polarity, SeriesKey};

pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegressionAlert {
    pub series: SeriesKey,
    /// Stored commit metadata for the entry, as first recorded.
    pub commit: Commit,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub value: f64,
    pub uncertainty: f64,
    pub unit: String,
    pub baseline: Baseline,
    pub deviation: f64,
    pub threshold: f64,
    pub polarity: Polarity,
}

impl RegressionAlert {
    /// Builds an alert when `evaluation` is a regression verdict.
    #[must_use]
    pub fn from_evaluation(
        series: &SeriesKey,
        entry: &SeriesEntry,
        evaluation: &Evaluation,
    ) -> Option<Self> {
        if evaluation.verdict != Verdict::Regression {
            return None;
        }
        Some(Self {
            series: series.clone(),
            commit: entry.run.commit.clone(),
            recorded_at: entry.run.recorded_at,
            value: entry.value,
            uncertainty: entry.uncertainty,
            unit: entry.unit.clone(),
            baseline: evaluation.baseline?,
            deviation: evaluation.deviation?,
            threshold: evaluation.threshold,
            polarity: evaluation.polarity,
        })
    }
}

pub trait AlertSink: Send + Sync {
    /// # Errors
    /// Returns [`BenchError::AlertDelivery`] when the alert cannot be delivered.
    fn notify(&self, alert: &RegressionAlert) -> Result<(), BenchError>;
}

/// Emits one `warn` event per regression.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn notify(&self, alert: &RegressionAlert) -> Result<(), BenchError> {
        tracing::warn!(
            series = %alert.series,
            commit = %alert.commit.sha,
            author = %alert.commit.author.name,
            value = alert.value,
            unit = %alert.unit,
            baseline = alert.baseline.center,
            spread = alert.baseline.spread,
            deviation = alert.deviation,
            threshold = alert.threshold,
            "benchmark regression detected"
        );
        Ok(())
    }
}

/// Appends one JSON object per alert to a file.
#[derive(Debug)]
pub struct JsonLinesAlertSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesAlertSink {
    /// # Errors
    /// Returns [`BenchError::AlertDelivery`] when the file cannot be opened for
    /// appending.
    pub fn open(path: &Path) -> Result<Self, BenchError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                BenchError::AlertDelivery(format!("failed to open {}: {err}", path.display()))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AlertSink for JsonLinesAlertSink {
    fn notify(&self, alert: &RegressionAlert) -> Result<(), BenchError> {
        let mut line = serde_json::to_string(alert)
            .map_err(|err| BenchError::AlertDelivery(format!("failed to encode alert: {err}")))?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| BenchError::AlertDelivery("alert log mutex poisoned".to_string()))?;
        file.write_all(line.as_bytes()).map_err(|err| {
            BenchError::AlertDelivery(format!("failed to write {}: {err}", self.path.display()))
        })
    }
}

/// Keeps alerts in memory.
#[derive(Debug, Default)]
pub struct CollectingAlertSink {
    alerts: Mutex<Vec<RegressionAlert>>,
}

impl CollectingAlertSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, Vec<RegressionAlert>> {
        self.alerts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn alerts(&self) -> Vec<RegressionAlert> {
        self.guard().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.guard().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlertSink for CollectingAlertSink {
    fn notify(&self, alert: &RegressionAlert) -> Result<(), BenchError> {
        self.guard().push(alert.clone());
        Ok(())
    }
}

/// Delivers to an inner sink on a background thread through a bounded queue.
///
/// A full queue drops the alert with a warning. Dropping the sink drains what
/// is already queued.
pub struct QueuedAlertSink {
    sender: Mutex<Option<SyncSender<RegressionAlert>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl QueuedAlertSink {
    /// # Errors
    /// Returns [`BenchError::AlertDelivery`] when the delivery thread cannot be
    /// spawned.
    pub fn spawn(inner: Box<dyn AlertSink>, capacity: usize) -> Result<Self, BenchError> {
        let (sender, receiver) = sync_channel::<RegressionAlert>(capacity.max(1));
        let worker = std::thread::Builder::new()
            .name("benchtrack-alerts".to_string())
            .spawn(move || {
                for alert in receiver {
                    if let Err(err) = inner.notify(&alert) {
                        tracing::warn!(series = %alert.series, error = %err, "queued alert delivery failed");
                    }
                }
            })
            .map_err(|err| {
                BenchError::AlertDelivery(format!("failed to spawn alert worker: {err}"))
            })?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            dropped: AtomicU64::new(0),
        })
    }

    /// Alerts discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes the queue and waits for queued alerts to be delivered.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::warn!("alert worker panicked");
            }
        }
    }
}

impl AlertSink for QueuedAlertSink {
    fn notify(&self, alert: &RegressionAlert) -> Result<(), BenchError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| BenchError::AlertDelivery("alert queue mutex poisoned".to_string()))?;
        let Some(sender) = sender.as_ref() else {
            return Err(BenchError::AlertDelivery("alert queue is shut down".to_string()));
        };
        match sender.try_send(alert.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(alert)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(series = %alert.series, commit = %alert.commit.sha, "alert queue full, dropping alert");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(BenchError::AlertDelivery(
                "alert worker stopped".to_string(),
            )),
        }
    }
}

impl Drop for QueuedAlertSink {
    fn drop(&mut self) {
        self.shutdown();
    }
}
