//! Jobs and their completion tracking.
//!
//! A [`Job`] is one object-store item claimed by this loader. While it is
//! processed a [`JobTracker`] counts the entries handed to the dispatcher and
//! the entries that finished. The tracker resolves its completion channel
//! exactly once, after the file has been read to the end and every dispatched
//! entry has finished (successfully or not).

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Content layout of an object, derived from its key suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Ndjson,
    Json,
    Unknown,
}

impl FileType {
    /// Classifies an object key: `.ndjson`/`.NDJSON` and `.json`/`.JSON`.
    pub fn from_key(key: &str) -> Self {
        if key.ends_with(".ndjson") || key.ends_with(".NDJSON") {
            Self::Ndjson
        } else if key.ends_with(".json") || key.ends_with(".JSON") {
            Self::Json
        } else {
            Self::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::Json => "json",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ndjson" => Ok(Self::Ndjson),
            "json" => Ok(Self::Json),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown file type: {other}")),
        }
    }
}

/// One object-store item claimed for processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub bucket: String,
    pub key: String,
    pub file_type: FileType,
    /// Row id of the registered bucket item.
    pub bundle_id: u64,
    /// Incremented each time the object changes.
    pub version: u32,
    /// Id of this particular load attempt; errors are recorded against it.
    pub load_id: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub allocated_at: OffsetDateTime,
}

impl Job {
    pub fn new(
        bucket: impl Into<String>,
        key: impl Into<String>,
        file_type: FileType,
        bundle_id: u64,
        version: u32,
        load_id: u64,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            bucket: bucket.into(),
            key: key.into(),
            file_type,
            bundle_id,
            version,
            load_id,
            allocated_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Processing statistics reported when a job is marked done.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub entries_dispatched: u64,
    /// Finished entries, including failed ones.
    pub entries_completed: u64,
    pub entries_failed: u64,
    /// Lines rejected before dispatch (parse or validation errors).
    pub line_errors: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    /// Response time of the most recent processor call, in milliseconds.
    pub last_call_ms: Option<u64>,
}

#[derive(Debug)]
struct TrackerState {
    stats: JobStats,
    file_complete: bool,
    done_tx: Option<oneshot::Sender<JobStats>>,
}

/// Shared completion counter for one job.
#[derive(Debug)]
pub struct JobTracker {
    job: Job,
    state: Mutex<TrackerState>,
}

impl JobTracker {
    /// Creates a tracker and the receiver resolved when the job completes.
    ///
    /// If every clone of the tracker is dropped before completion the receiver
    /// yields an error instead; the job was abandoned.
    pub fn new(job: Job) -> (Arc<Self>, oneshot::Receiver<JobStats>) {
        let (done_tx, done_rx) = oneshot::channel();
        let tracker = Arc::new(Self {
            job,
            state: Mutex::new(TrackerState {
                stats: JobStats {
                    started_at: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
                file_complete: false,
                done_tx: Some(done_tx),
            }),
        });
        (tracker, done_rx)
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by the dispatcher once an entry holds capacity and is about to run.
    pub fn entry_dispatched(&self) {
        self.lock().stats.entries_dispatched += 1;
    }

    /// Called when a dispatched entry finished, whatever the outcome.
    pub fn entry_completed(&self, success: bool, elapsed: Duration) {
        let mut state = self.lock();
        state.stats.entries_completed += 1;
        if !success {
            state.stats.entries_failed += 1;
        }
        state.stats.last_call_ms = Some(elapsed.as_millis() as u64);
        Self::maybe_complete(&mut state);
    }

    pub fn record_line_error(&self) {
        self.lock().stats.line_errors += 1;
    }

    /// Called once the whole object has been read.
    pub fn file_processing_complete(&self) {
        let mut state = self.lock();
        state.file_complete = true;
        Self::maybe_complete(&mut state);
    }

    pub fn stats(&self) -> JobStats {
        self.lock().stats.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.lock().done_tx.is_none()
    }

    fn maybe_complete(state: &mut TrackerState) {
        if !state.file_complete || state.stats.entries_completed != state.stats.entries_dispatched
        {
            return;
        }
        if let Some(tx) = state.done_tx.take() {
            state.stats.finished_at = Some(OffsetDateTime::now_utc());
            // The allocator may have stopped listening; nothing else to do then.
            let _ = tx.send(state.stats.clone());
        }
    }
}

/// One parsed resource waiting for dispatch.
#[derive(Debug, Clone)]
pub struct ResourceEntry {
    pub tracker: Arc<JobTracker>,
    pub resource: Value,
    /// Zero-based line within the source object.
    pub line: usize,
    pub cost: usize,
}

impl ResourceEntry {
    pub fn job(&self) -> &Job {
        self.tracker.job()
    }
}
