//! Fire-and-forget extraction telemetry.
//!
//! Each processed page produces one [`ExtractionRecord`] summarizing the
//! per-method texts and scores, the direct-text attempt, and the final
//! answer. Sinks must never block or fail page processing: the queued
//! sink drops records once its bounded queue fills, and a circuit breaker
//! stops delivery attempts after repeated consecutive failures.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// One method's contribution to a page record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MethodRecord {
    pub text: String,
    pub score: i32,
    pub confidence: f32,
}

/// The per-page extraction record shipped to the telemetry sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractionRecord {
    /// Unix timestamp in seconds, stamped at record creation.
    pub timestamp: u64,
    pub job_id: String,
    pub original_filename: String,
    /// 1-based page number.
    pub page_number: usize,
    /// Per-method results, keyed by method id.
    pub method_results: BTreeMap<String, MethodRecord>,
    pub direct_text: String,
    pub final_answer: String,
    /// `success`, `no_text_found`, or `error`.
    pub status: String,
    pub quality_flags: String,
    pub error_message: String,
}

impl ExtractionRecord {
    /// Stamps a record with the current wall-clock time.
    pub fn now(job_id: impl Into<String>, filename: impl Into<String>, page_number: usize) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            timestamp,
            job_id: job_id.into(),
            original_filename: filename.into(),
            page_number,
            method_results: BTreeMap::new(),
            direct_text: String::new(),
            final_answer: String::new(),
            status: "success".to_string(),
            quality_flags: String::new(),
            error_message: String::new(),
        }
    }
}

/// A telemetry sink. `record` must return quickly and must not propagate
/// failures to the caller.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: ExtractionRecord);

    /// Flushes any buffered records. Called once at job end.
    fn flush(&self) {}
}

/// Discards every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _record: ExtractionRecord) {}
}

/// Appends records as JSON lines to a file.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<Option<std::fs::File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().expect("jsonl sink poisoned");
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            *guard = Some(
                std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)?,
            );
        }
        let file = guard.as_mut().expect("file opened above");
        writeln!(file, "{line}")
    }
}

impl TelemetrySink for JsonlSink {
    fn record(&self, record: ExtractionRecord) {
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize telemetry record");
                return;
            }
        };
        if let Err(e) = self.write_line(&line) {
            warn!(error = %e, path = %self.path.display(), "telemetry write failed");
        }
    }

    fn flush(&self) {
        if let Some(file) = self.file.lock().expect("jsonl sink poisoned").as_mut() {
            let _ = file.flush();
        }
    }
}

enum QueueMessage {
    Record(Box<ExtractionRecord>),
    Flush,
}

/// Bounded-queue sink that delivers to an inner sink from a worker
/// thread. Records are dropped when the queue is full, and a circuit
/// breaker silences the inner sink after a configured number of
/// consecutive delivery failures. Dropping the sink closes the queue and
/// joins the worker after it drains.
pub struct QueuedSink {
    sender: Mutex<Option<SyncSender<QueueMessage>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl QueuedSink {
    pub fn new(
        inner: Box<dyn FallibleSink>,
        queue_size: usize,
        circuit_breaker_threshold: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::sync_channel(queue_size.max(1));
        let worker = std::thread::Builder::new()
            .name("telemetry-sink".to_string())
            .spawn(move || run_worker(inner, receiver, circuit_breaker_threshold))
            .expect("failed to spawn telemetry worker");
        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn send(&self, message: QueueMessage) {
        let guard = self.sender.lock().expect("queued sink poisoned");
        let Some(sender) = guard.as_ref() else {
            return;
        };
        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                debug!("telemetry queue full, dropping record");
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("telemetry worker gone, dropping record");
            }
        }
    }
}

impl TelemetrySink for QueuedSink {
    fn record(&self, record: ExtractionRecord) {
        self.send(QueueMessage::Record(Box::new(record)));
    }

    fn flush(&self) {
        self.send(QueueMessage::Flush);
    }
}

impl Drop for QueuedSink {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain its backlog and exit.
        self.sender.lock().expect("queued sink poisoned").take();
        if let Some(handle) = self.worker.lock().expect("queued sink poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// A delivery target that can fail per record, wrapped by [`QueuedSink`]'s
/// retry/circuit-breaker policy.
pub trait FallibleSink: Send {
    fn deliver(&mut self, record: &ExtractionRecord) -> Result<(), String>;
    fn flush(&mut self) {}
}

/// JSONL-backed fallible sink for use behind a queue.
pub struct JsonlTarget {
    inner: JsonlSink,
}

impl JsonlTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonlSink::new(path),
        }
    }
}

impl FallibleSink for JsonlTarget {
    fn deliver(&mut self, record: &ExtractionRecord) -> Result<(), String> {
        let line = serde_json::to_string(record).map_err(|e| e.to_string())?;
        self.inner.write_line(&line).map_err(|e| e.to_string())
    }

    fn flush(&mut self) {
        TelemetrySink::flush(&self.inner);
    }
}

fn run_worker(
    mut inner: Box<dyn FallibleSink>,
    receiver: Receiver<QueueMessage>,
    circuit_breaker_threshold: usize,
) {
    let mut consecutive_failures = 0usize;
    let mut tripped = false;

    while let Ok(message) = receiver.recv() {
        match message {
            QueueMessage::Record(record) => {
                if tripped {
                    continue;
                }
                match inner.deliver(&record) {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        warn!(
                            error = %e,
                            consecutive_failures,
                            "telemetry delivery failed"
                        );
                        if consecutive_failures >= circuit_breaker_threshold.max(1) {
                            warn!("telemetry circuit breaker tripped, dropping further records");
                            tripped = true;
                        }
                    }
                }
            }
            QueueMessage::Flush => inner.flush(),
        }
    }
    inner.flush();
}
