//! Reads a job's object, validates each resource and hands it to the
//! dispatcher.
//!
//! NDJSON objects are read line by line; a line that fails to decode, parse
//! or validate is recorded as a load error and skipped, the rest of the file
//! continues. JSON objects hold a single resource. I/O errors end the job.

use std::sync::Arc;

use octofhir_core::bundle::entries;
use octofhir_core::is_bundle;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::config::StreamSettings;
use crate::data_access::DataAccess;
use crate::dispatcher::ResourceDispatcher;
use crate::error::{BucketError, Result};
use crate::job::{FileType, JobTracker, ResourceEntry};
use crate::validation::{ResourceValidator, failure_message, has_failures};

/// Dispatch cost of a resource: 1, or `max(1, floor(factor * entries))` for a bundle.
pub fn entry_cost(resource: &Value, bundle_cost_factor: f64) -> usize {
    if !is_bundle(resource) {
        return 1;
    }
    let weighted = (bundle_cost_factor * entries(resource).len() as f64).floor();
    (weighted as usize).max(1)
}

/// Strips the `\n` or `\r\n` terminator of a raw line.
fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Counters for one processed object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub lines_read: usize,
    pub skipped: usize,
    pub dispatched: usize,
    pub errors: usize,
}

/// How NDJSON lines already loaded by an earlier attempt are skipped.
enum Skip {
    None,
    UpTo(usize),
    Exact,
}

pub struct StreamProcessor {
    data_access: Arc<dyn DataAccess>,
    validator: Arc<dyn ResourceValidator>,
    dispatcher: Arc<ResourceDispatcher>,
    settings: StreamSettings,
    bundle_cost_factor: f64,
}

impl StreamProcessor {
    pub fn new(
        data_access: Arc<dyn DataAccess>,
        validator: Arc<dyn ResourceValidator>,
        dispatcher: Arc<ResourceDispatcher>,
        settings: StreamSettings,
        bundle_cost_factor: f64,
    ) -> Self {
        Self {
            data_access,
            validator,
            dispatcher,
            settings,
            bundle_cost_factor,
        }
    }

    /// Processes the whole object and signals file completion to the tracker.
    ///
    /// Completion is not signalled when an error is returned; the job is then
    /// left for a later attempt.
    pub async fn process<R>(&self, tracker: &Arc<JobTracker>, reader: R) -> Result<StreamSummary>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let summary = match tracker.job().file_type {
            FileType::Ndjson => self.process_ndjson(tracker, reader).await?,
            FileType::Json => self.process_json(tracker, reader).await?,
            FileType::Unknown => {
                return Err(BucketError::object_store(format!(
                    "unsupported file type for {}",
                    tracker.job().key
                )));
            }
        };
        tracker.file_processing_complete();
        info!(
            key = %tracker.job().key,
            lines = summary.lines_read,
            skipped = summary.skipped,
            dispatched = summary.dispatched,
            errors = summary.errors,
            "Finished reading object"
        );
        Ok(summary)
    }

    async fn skip_mode(&self, tracker: &JobTracker) -> Skip {
        if self.settings.incremental_exact {
            return Skip::Exact;
        }
        if !self.settings.incremental {
            return Skip::None;
        }
        let job = tracker.job();
        match self
            .data_access
            .get_last_processed_line_number(job.bundle_id, job.version)
            .await
        {
            Ok(Some(line)) => Skip::UpTo(line),
            Ok(None) => Skip::None,
            Err(e) => {
                warn!(key = %job.key, error = %e, "Cannot read last processed line; reading all lines");
                Skip::None
            }
        }
    }

    async fn already_loaded(&self, tracker: &JobTracker, skip: &Skip, line: usize) -> bool {
        match skip {
            Skip::None => false,
            Skip::UpTo(last) => line <= *last,
            Skip::Exact => {
                let job = tracker.job();
                match self
                    .data_access
                    .get_resource_refs_for_line(job.bundle_id, job.version, line)
                    .await
                {
                    Ok(refs) => !refs.is_empty(),
                    Err(e) => {
                        warn!(line, error = %e, "Cannot read resource refs; reprocessing line");
                        false
                    }
                }
            }
        }
    }

    async fn process_ndjson<R>(&self, tracker: &Arc<JobTracker>, mut reader: R) -> Result<StreamSummary>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let skip = self.skip_mode(tracker).await;
        let mut summary = StreamSummary::default();
        let mut buf = Vec::new();
        let mut line = 0usize;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            let current = line;
            line += 1;
            summary.lines_read += 1;
            if buf.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if self.already_loaded(tracker, &skip, current).await {
                summary.skipped += 1;
                continue;
            }
            match std::str::from_utf8(trim_line_end(&buf)) {
                Ok(text) => {
                    self.process_text(tracker, text, current, &mut summary)
                        .await?
                }
                Err(e) => {
                    self.record_line_error(tracker, current, format!("Invalid UTF-8: {e}"))
                        .await;
                    summary.errors += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn process_json<R>(&self, tracker: &Arc<JobTracker>, mut reader: R) -> Result<StreamSummary>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await?;
        let mut summary = StreamSummary {
            lines_read: 1,
            ..Default::default()
        };
        match String::from_utf8(bytes) {
            Ok(text) => self.process_text(tracker, &text, 0, &mut summary).await?,
            Err(e) => {
                self.record_line_error(tracker, 0, format!("Invalid UTF-8: {e}"))
                    .await;
                summary.errors += 1;
            }
        }
        Ok(summary)
    }

    /// Parses, validates and dispatches one resource.
    ///
    /// Only a stopped dispatcher is an error here; everything else is
    /// recorded against the line.
    async fn process_text(
        &self,
        tracker: &Arc<JobTracker>,
        text: &str,
        line: usize,
        summary: &mut StreamSummary,
    ) -> Result<()> {
        let resource: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.record_line_error(tracker, line, format!("JSON parse error: {e}"))
                    .await;
                summary.errors += 1;
                return Ok(());
            }
        };

        let issues = self.validator.validate(&resource);
        if has_failures(&issues) {
            self.record_line_error(tracker, line, failure_message(&issues))
                .await;
            summary.errors += 1;
            return Ok(());
        }
        if self.settings.log_warnings {
            for issue in &issues {
                warn!(
                    key = %tracker.job().key,
                    line,
                    severity = issue.severity.as_str(),
                    code = %issue.code,
                    "{}",
                    issue.text()
                );
            }
        }

        let cost = entry_cost(&resource, self.bundle_cost_factor);
        let entry = ResourceEntry {
            tracker: Arc::clone(tracker),
            resource,
            line,
            cost,
        };
        if !self.dispatcher.process(entry).await {
            let message = "dispatcher stopped before the resource was accepted".to_string();
            self.record_line_error(tracker, line, message).await;
            summary.errors += 1;
            return Err(BucketError::Stopped);
        }
        debug!(line, cost, "Dispatched resource");
        summary.dispatched += 1;
        Ok(())
    }

    async fn record_line_error(&self, tracker: &JobTracker, line: usize, message: String) {
        let job = tracker.job();
        warn!(key = %job.key, line, error = %message, "Rejected line");
        tracker.record_line_error();
        if let Err(e) = self
            .data_access
            .record_errors(job.load_id, Some(line), &[message])
            .await
        {
            warn!(load_id = job.load_id, line, error = %e, "Failed to record line error");
        }
    }
}
