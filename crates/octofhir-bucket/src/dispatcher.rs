//! Bounded-concurrency dispatch of resource entries.
//!
//! Each accepted entry reserves its cost on a [`CapacityLimiter`] and runs on
//! its own task. The task always returns the capacity and reports completion
//! to the owning job, whether the processor succeeds, fails or panics.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use tracing::{debug, error, warn};

use crate::capacity::CapacityLimiter;
use crate::data_access::DataAccess;
use crate::job::ResourceEntry;
use crate::processor::ResourceProcessor;

pub struct ResourceDispatcher {
    limiter: Arc<CapacityLimiter>,
    processor: Arc<dyn ResourceProcessor>,
    data_access: Arc<dyn DataAccess>,
}

impl ResourceDispatcher {
    pub fn new(
        max_concurrent: usize,
        processor: Arc<dyn ResourceProcessor>,
        data_access: Arc<dyn DataAccess>,
    ) -> Self {
        Self {
            limiter: Arc::new(CapacityLimiter::without_hysteresis(max_concurrent)),
            processor,
            data_access,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.limiter.max_inflight()
    }

    pub async fn inflight(&self) -> usize {
        self.limiter.inflight().await
    }

    /// Hands an entry to the worker pool, waiting for capacity if needed.
    ///
    /// Returns `false` when the dispatcher was stopped before capacity became
    /// available; the entry is then not counted against its job.
    pub async fn process(&self, entry: ResourceEntry) -> bool {
        let cost = entry.cost.clamp(1, self.limiter.max_inflight());
        if !self.limiter.acquire(cost).await {
            return false;
        }
        entry.tracker.entry_dispatched();

        let limiter = Arc::clone(&self.limiter);
        let processor = Arc::clone(&self.processor);
        let data_access = Arc::clone(&self.data_access);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(processor.process(&entry))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed();

            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    warn!(
                        key = %entry.job().key,
                        line = entry.line,
                        processor = processor.name(),
                        input_error = e.is_input_error(),
                        transient = e.is_transient(),
                        error = %e,
                        "Resource processing failed"
                    );
                    Some(e.to_string())
                }
                Err(_) => {
                    error!(
                        key = %entry.job().key,
                        line = entry.line,
                        processor = processor.name(),
                        "Resource processor panicked"
                    );
                    Some("resource processor panicked".to_string())
                }
            };

            if let Some(message) = &failure {
                let load_id = entry.job().load_id;
                if let Err(e) = data_access
                    .record_errors(load_id, Some(entry.line), std::slice::from_ref(message))
                    .await
                {
                    error!(load_id, line = entry.line, error = %e, "Failed to record error");
                }
            }

            limiter.release(cost).await;
            debug!(
                line = entry.line,
                cost,
                elapsed_ms = elapsed.as_millis() as u64,
                "Entry finished"
            );
            entry.tracker.entry_completed(failure.is_none(), elapsed);
        });
        true
    }

    /// Stops accepting entries. Entries already running are left to finish.
    pub fn stop(&self) {
        self.limiter.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_access::InMemoryDataAccess;
    use crate::error::{BucketError, Result};
    use crate::job::{FileType, Job, JobTracker};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Tracks the peak cost running at once and fails or panics on request.
    #[derive(Default)]
    struct ScriptedProcessor {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl ResourceProcessor for ScriptedProcessor {
        async fn process(&self, entry: &ResourceEntry) -> Result<()> {
            let now = self.running.fetch_add(entry.cost, Ordering::SeqCst) + entry.cost;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(entry.cost, Ordering::SeqCst);
            match entry.resource["mode"].as_str() {
                Some("fail") => Err(BucketError::invalid_bundle("boom")),
                Some("panic") => panic!("processor exploded"),
                _ => Ok(()),
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }

    fn entry(tracker: &Arc<JobTracker>, mode: &str, line: usize, cost: usize) -> ResourceEntry {
        ResourceEntry {
            tracker: Arc::clone(tracker),
            resource: json!({"resourceType": "Basic", "mode": mode}),
            line,
            cost,
        }
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let scripted = Arc::new(ScriptedProcessor::default());
        let da = Arc::new(InMemoryDataAccess::new());
        let dispatcher = ResourceDispatcher::new(3, scripted.clone(), da);
        let (tracker, done) = JobTracker::new(Job::new("b", "k.ndjson", FileType::Ndjson, 1, 1, 1));

        for line in 0..12 {
            assert!(dispatcher.process(entry(&tracker, "ok", line, 1 + line % 2)).await);
        }
        tracker.file_processing_complete();

        let stats = timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(stats.entries_dispatched, 12);
        assert_eq!(stats.entries_completed, 12);
        assert!(scripted.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(dispatcher.inflight().await, 0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_release_capacity() {
        let scripted = Arc::new(ScriptedProcessor::default());
        let da = Arc::new(InMemoryDataAccess::new());
        let dispatcher = ResourceDispatcher::new(2, scripted, da.clone());
        let (tracker, done) = JobTracker::new(Job::new("b", "k.ndjson", FileType::Ndjson, 1, 1, 9));

        assert!(dispatcher.process(entry(&tracker, "fail", 0, 1)).await);
        assert!(dispatcher.process(entry(&tracker, "panic", 1, 1)).await);
        assert!(dispatcher.process(entry(&tracker, "ok", 2, 5)).await);
        tracker.file_processing_complete();

        let stats = timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
        assert_eq!(stats.entries_completed, 3);
        assert_eq!(stats.entries_failed, 2);
        assert_eq!(dispatcher.inflight().await, 0);

        let errors = da.errors().await;
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.load_id == 9));
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_rejects() {
        let scripted = Arc::new(ScriptedProcessor::default());
        let dispatcher = ResourceDispatcher::new(1, scripted, Arc::new(InMemoryDataAccess::new()));
        let (tracker, _done) = JobTracker::new(Job::new("b", "k.json", FileType::Json, 1, 1, 1));

        dispatcher.stop();
        assert!(!dispatcher.process(entry(&tracker, "ok", 0, 1)).await);
        assert_eq!(tracker.stats().entries_dispatched, 0);
    }
}
