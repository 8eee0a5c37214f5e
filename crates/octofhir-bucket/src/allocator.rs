//! Job allocator.
//!
//! One allocator task runs per file type. It waits until fewer than
//! `rescan_threshold` jobs are in flight, asks the backing store for as many
//! jobs as there is free capacity, and starts each one through a
//! [`JobHandler`]. A bookkeeping task per job waits for the job's completion,
//! marks it done and returns its capacity unit.
//!
//! The limiter lock is held across the allocation call, so allocation calls
//! are serialized and completions wait until the call returns.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::capacity::CapacityLimiter;
use crate::config::AllocatorSettings;
use crate::data_access::DataAccess;
use crate::job::{FileType, Job, JobTracker};
use crate::stop::{StopSignal, join_with_timeout, sleep_or_stop, stopped};

/// Starts processing of an allocated job.
///
/// Implementations must not block; they are expected to spawn the work and
/// drive the tracker to completion (or drop it to abandon the job).
pub trait JobHandler: Send + Sync {
    fn start(&self, tracker: Arc<JobTracker>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorState {
    WaitingForCapacity,
    Allocating,
    SleepingNoWork,
    SleepingOnError,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    pub file_type: FileType,
    pub max_inflight: usize,
    pub rescan_threshold: usize,
    pub recycle_seconds: u64,
    pub path_scope: Option<String>,
    pub no_work_nap: Duration,
    pub error_backoff: Duration,
    pub stop_timeout: Duration,
}

impl AllocatorOptions {
    pub fn from_settings(
        file_type: FileType,
        settings: &AllocatorSettings,
        path_scope: Option<String>,
    ) -> Self {
        Self {
            file_type,
            max_inflight: settings.max_inflight_jobs,
            rescan_threshold: settings.effective_rescan_threshold(),
            recycle_seconds: settings.recycle_seconds,
            path_scope,
            no_work_nap: settings.no_work_nap(),
            error_backoff: settings.error_backoff(),
            stop_timeout: settings.stop_timeout(),
        }
    }
}

struct Shared {
    options: AllocatorOptions,
    limiter: CapacityLimiter,
    data_access: Arc<dyn DataAccess>,
    handler: Arc<dyn JobHandler>,
    stop: StopSignal,
    state: watch::Sender<AllocatorState>,
}

pub struct JobAllocator {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobAllocator {
    pub fn new(
        options: AllocatorOptions,
        data_access: Arc<dyn DataAccess>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let limiter = CapacityLimiter::new(options.max_inflight, Some(options.rescan_threshold));
        let (state, _) = watch::channel(AllocatorState::WaitingForCapacity);
        Self {
            shared: Arc::new(Shared {
                options,
                limiter,
                data_access,
                handler,
                stop: StopSignal::new(),
                state,
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn file_type(&self) -> FileType {
        self.shared.options.file_type
    }

    pub fn state(&self) -> AllocatorState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<AllocatorState> {
        self.shared.state.subscribe()
    }

    /// Jobs allocated and not yet done.
    pub async fn inflight(&self) -> usize {
        self.shared.limiter.inflight().await
    }

    /// Spawns the allocation loop. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *handle = Some(tokio::spawn(run(shared)));
    }

    /// Stops allocating and wakes the loop out of any wait or sleep.
    pub fn signal_stop(&self) {
        self.shared.stop.signal();
        self.shared.limiter.stop();
    }

    /// Signals stop and waits for the loop to end, at most `stop_timeout`.
    pub async fn wait_for_stop(&self) {
        self.signal_stop();
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            let name = format!("allocator-{}", self.shared.options.file_type);
            join_with_timeout(&name, handle, self.shared.options.stop_timeout).await;
        }
        self.shared.state.send_replace(AllocatorState::Stopped);
    }
}

async fn run(shared: Arc<Shared>) {
    let options = &shared.options;
    let mut stop_rx = shared.stop.subscribe();
    info!(
        file_type = %options.file_type,
        max_inflight = options.max_inflight,
        rescan_threshold = options.rescan_threshold,
        "Job allocator started"
    );

    while !shared.stop.is_stopped() {
        shared.state.send_replace(AllocatorState::WaitingForCapacity);
        let Some(mut headroom) = shared.limiter.wait_for_headroom().await else {
            break;
        };

        shared.state.send_replace(AllocatorState::Allocating);
        let free = headroom.free();
        let mut jobs = Vec::new();
        let allocation = tokio::select! {
            result = shared.data_access.allocate_jobs(
                &mut jobs,
                options.file_type,
                free,
                options.recycle_seconds,
                options.path_scope.as_deref(),
            ) => result,
            _ = stopped(&mut stop_rx) => break,
        };

        match allocation {
            Ok(_) => {
                let allocated = headroom.reserve(jobs.len());
                let inflight = headroom.inflight();
                drop(headroom);
                if jobs.len() > allocated {
                    // Unlaunched claims are recycled once they expire.
                    warn!(
                        file_type = %options.file_type,
                        claimed = jobs.len(),
                        allocated,
                        "Store returned more jobs than requested"
                    );
                    jobs.truncate(allocated);
                }
                if allocated > 0 {
                    debug!(file_type = %options.file_type, allocated, inflight, "Allocated jobs");
                }
                for job in jobs {
                    launch(&shared, job);
                }
                if allocated < free {
                    shared.state.send_replace(AllocatorState::SleepingNoWork);
                    if !sleep_or_stop(&mut stop_rx, options.no_work_nap).await {
                        break;
                    }
                }
            }
            Err(e) => {
                drop(headroom);
                error!(
                    file_type = %options.file_type,
                    error = %e,
                    backoff_ms = options.error_backoff.as_millis() as u64,
                    "Job allocation failed"
                );
                shared.state.send_replace(AllocatorState::SleepingOnError);
                if !sleep_or_stop(&mut stop_rx, options.error_backoff).await {
                    break;
                }
            }
        }
    }

    shared.state.send_replace(AllocatorState::Stopped);
    info!(file_type = %options.file_type, "Job allocator stopped");
}

fn launch(shared: &Arc<Shared>, job: Job) {
    let (tracker, done) = JobTracker::new(job.clone());
    info!(job_id = %job.job_id, bucket = %job.bucket, key = %job.key, "Starting job");
    shared.handler.start(tracker);

    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        match done.await {
            Ok(stats) => match shared.data_access.mark_job_done(&job, &stats).await {
                Ok(()) => info!(
                    job_id = %job.job_id,
                    key = %job.key,
                    entries = stats.entries_completed,
                    failed = stats.entries_failed,
                    line_errors = stats.line_errors,
                    "Job done"
                ),
                Err(e) => error!(job_id = %job.job_id, key = %job.key, error = %e, "Failed to mark job done"),
            },
            Err(_) => warn!(
                job_id = %job.job_id,
                key = %job.key,
                "Job ended without completing; it will be recycled"
            ),
        }
        shared.limiter.release(1).await;
    });
}
