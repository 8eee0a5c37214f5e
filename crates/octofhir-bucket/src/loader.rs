//! Wires the loader together: scanner, one allocator per file type, the job
//! runner, the dispatcher and the heartbeat.

use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use octofhir_storage::DynStorage;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::allocator::{AllocatorOptions, JobAllocator, JobHandler};
use crate::bundle::BundleSplitter;
use crate::config::BucketConfig;
use crate::data_access::DataAccess;
use crate::dispatcher::ResourceDispatcher;
use crate::error::{BucketError, Result};
use crate::job::JobTracker;
use crate::object_store::ObjectStore;
use crate::processor::{BundleBreakerProcessor, ResourceProcessor, StorageResourceProcessor};
use crate::scanner::{BucketScanner, ScanSummary, ScannerOptions};
use crate::stop::{StopSignal, join_with_timeout, sleep_or_stop};
use crate::stream::StreamProcessor;
use crate::validation::BasicResourceValidator;

/// Builds the processor chain for `config`: storage, wrapped in the bundle
/// breaker when splitting is enabled.
pub fn build_processor(
    config: &BucketConfig,
    storage: DynStorage,
    object_store: Arc<dyn ObjectStore>,
    data_access: Arc<dyn DataAccess>,
) -> Arc<dyn ResourceProcessor> {
    let storage_processor: Arc<dyn ResourceProcessor> =
        Arc::new(StorageResourceProcessor::new(storage, data_access));
    if !config.splitter.enabled {
        return storage_processor;
    }
    Arc::new(BundleBreakerProcessor::new(
        BundleSplitter::new(config.splitter.max_bundle_size),
        object_store,
        config.output_bucket(),
        config.splitter.output_prefix.clone(),
        storage_processor,
    ))
}

/// Reads an allocated job's object and streams it through the dispatcher.
struct JobRunner {
    object_store: Arc<dyn ObjectStore>,
    data_access: Arc<dyn DataAccess>,
    stream: Arc<StreamProcessor>,
}

impl JobHandler for JobRunner {
    fn start(&self, tracker: Arc<JobTracker>) {
        let object_store = Arc::clone(&self.object_store);
        let data_access = Arc::clone(&self.data_access);
        let stream = Arc::clone(&self.stream);
        tokio::spawn(async move {
            let job = tracker.job();
            let outcome = match object_store.read_object(&job.bucket, &job.key).await {
                Ok(reader) => stream.process(&tracker, reader).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                // The tracker is dropped without completing, so the job is
                // left to be recycled.
                error!(job_id = %job.job_id, key = %job.key, error = %e, "Job failed");
                if let Err(record_err) = data_access
                    .record_errors(job.load_id, None, &[e.to_string()])
                    .await
                {
                    warn!(load_id = job.load_id, error = %record_err, "Failed to record job error");
                }
            }
        });
    }
}

pub struct BucketLoader {
    config: BucketConfig,
    object_store: Arc<dyn ObjectStore>,
    data_access: Arc<dyn DataAccess>,
    dispatcher: Arc<ResourceDispatcher>,
    allocators: Vec<JobAllocator>,
    scanner: BucketScanner,
    heartbeat_stop: StopSignal,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl BucketLoader {
    pub fn new(
        config: BucketConfig,
        object_store: Arc<dyn ObjectStore>,
        data_access: Arc<dyn DataAccess>,
        processor: Arc<dyn ResourceProcessor>,
    ) -> Result<Self> {
        config.validate().map_err(BucketError::configuration)?;

        let dispatcher = Arc::new(ResourceDispatcher::new(
            config.dispatcher.max_concurrent,
            processor,
            Arc::clone(&data_access),
        ));
        let stream = Arc::new(StreamProcessor::new(
            Arc::clone(&data_access),
            Arc::new(BasicResourceValidator),
            Arc::clone(&dispatcher),
            config.stream.clone(),
            config.dispatcher.bundle_cost_factor,
        ));
        let runner: Arc<dyn JobHandler> = Arc::new(JobRunner {
            object_store: Arc::clone(&object_store),
            data_access: Arc::clone(&data_access),
            stream,
        });

        let allocators = config
            .file_types()
            .into_iter()
            .map(|file_type| {
                let options = AllocatorOptions::from_settings(
                    file_type,
                    &config.allocator,
                    config.bucket.prefix.clone(),
                );
                JobAllocator::new(options, Arc::clone(&data_access), Arc::clone(&runner))
            })
            .collect();

        let scanner = BucketScanner::new(
            ScannerOptions {
                bucket: config.bucket.name.clone(),
                prefix: config.bucket.prefix.clone().unwrap_or_default(),
                interval: config.bucket.scan_interval(),
                stop_timeout: config.allocator.stop_timeout(),
            },
            Arc::clone(&object_store),
            Arc::clone(&data_access),
        );

        Ok(Self {
            config,
            object_store,
            data_access,
            dispatcher,
            allocators,
            scanner,
            heartbeat_stop: StopSignal::new(),
            heartbeat: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn allocators(&self) -> &[JobAllocator] {
        &self.allocators
    }

    pub fn dispatcher(&self) -> &ResourceDispatcher {
        &self.dispatcher
    }

    /// Runs a single scan of the configured bucket.
    pub async fn scan_once(&self) -> Result<ScanSummary> {
        self.scanner.scan_once().await
    }

    /// Starts the allocators, the periodic scanner and the heartbeat.
    pub fn start(&self) {
        info!(
            bucket = %self.config.bucket.name,
            object_store = self.object_store.backend_name(),
            allocators = self.allocators.len(),
            max_concurrent = self.dispatcher.max_concurrent(),
            "Starting bucket loader"
        );
        for allocator in &self.allocators {
            allocator.start();
        }
        self.scanner.start();
        self.start_heartbeat();
    }

    fn start_heartbeat(&self) {
        let mut handle = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return;
        }
        let data_access = Arc::clone(&self.data_access);
        let interval = self.config.bucket.heartbeat_interval();
        let mut stop_rx = self.heartbeat_stop.subscribe();
        *handle = Some(tokio::spawn(async move {
            loop {
                if let Err(e) = data_access.heartbeat().await {
                    warn!(error = %e, "Heartbeat failed");
                }
                if !sleep_or_stop(&mut stop_rx, interval).await {
                    break;
                }
            }
        }));
    }

    /// Stops new scans, allocations and dispatches. Running entries finish.
    pub fn signal_stop(&self) {
        for allocator in &self.allocators {
            allocator.signal_stop();
        }
        self.scanner.signal_stop();
        self.heartbeat_stop.signal();
        self.object_store.signal_stop();
        self.dispatcher.stop();
    }

    /// Signals stop and waits, bounded per task, for every background task.
    pub async fn wait_for_stop(&self) {
        self.signal_stop();
        join_all(self.allocators.iter().map(|a| a.wait_for_stop())).await;
        self.scanner.wait_for_stop().await;
        let handle = self.heartbeat.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            join_with_timeout("heartbeat", handle, self.config.allocator.stop_timeout()).await;
        }
        info!("Bucket loader stopped");
    }
}
