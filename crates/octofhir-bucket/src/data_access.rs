//! Backing store for loader bookkeeping.
//!
//! [`DataAccess`] tracks registered bucket items, hands them out as jobs,
//! keeps the append-only error log and remembers which resources each line
//! produced. [`InMemoryDataAccess`] keeps everything in process memory.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BucketError, Result};
use crate::job::{FileType, Job, JobStats};
use crate::object_store::BucketItem;

/// A line-scoped load error. Never removed once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceBundleError {
    pub load_id: u64,
    /// Zero-based line, or `None` for errors about the whole object.
    pub line: Option<usize>,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

/// A resource written from one line of a bundle object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub resource_type: String,
    pub logical_id: String,
    pub version_id: Option<String>,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            logical_id: logical_id.into(),
            version_id: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }
}

#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Claims up to `max_count` items of `file_type` and appends them to `out`.
    ///
    /// Claimable items are pending ones, and allocated ones not marked done
    /// within `recycle_seconds`. Returns the number of jobs appended.
    async fn allocate_jobs(
        &self,
        out: &mut Vec<Job>,
        file_type: FileType,
        max_count: usize,
        recycle_seconds: u64,
        path_scope: Option<&str>,
    ) -> Result<usize>;

    async fn mark_job_done(&self, job: &Job, stats: &JobStats) -> Result<()>;

    async fn record_errors(
        &self,
        load_id: u64,
        line: Option<usize>,
        errors: &[String],
    ) -> Result<()>;

    /// Highest line with recorded resources for this bundle version.
    async fn get_last_processed_line_number(
        &self,
        bundle_id: u64,
        version: u32,
    ) -> Result<Option<usize>>;

    async fn get_resource_refs_for_line(
        &self,
        bundle_id: u64,
        version: u32,
        line: usize,
    ) -> Result<Vec<ResourceRef>>;

    async fn record_resource_refs(&self, job: &Job, line: usize, refs: &[ResourceRef])
    -> Result<()>;

    /// Registers a scanned item. Returns `true` when the item is new or
    /// changed and now waits for processing.
    async fn register_bucket_item(&self, item: &BucketItem) -> Result<bool>;

    async fn heartbeat(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Allocated {
        load_id: u64,
        at: OffsetDateTime,
    },
    Done {
        load_id: u64,
    },
}

#[derive(Debug, Clone)]
struct ItemRow {
    bundle_id: u64,
    item: BucketItem,
    version: u32,
    state: ItemState,
    stats: Option<JobStats>,
}

#[derive(Debug, Default)]
struct Tables {
    items: Vec<ItemRow>,
    errors: Vec<ResourceBundleError>,
    refs: BTreeMap<(u64, u32, usize), Vec<ResourceRef>>,
    last_heartbeat: Option<OffsetDateTime>,
    next_bundle_id: u64,
    next_load_id: u64,
}

/// [`DataAccess`] kept in memory.
#[derive(Debug)]
pub struct InMemoryDataAccess {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for InMemoryDataAccess {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDataAccess {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an outage: while unavailable, `allocate_jobs` and
    /// `heartbeat` fail with a transient error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BucketError::data_access("backing store unavailable"))
        }
    }

    pub async fn errors(&self) -> Vec<ResourceBundleError> {
        self.tables.lock().await.errors.clone()
    }

    pub async fn item_state(&self, bucket: &str, key: &str) -> Option<ItemState> {
        self.tables
            .lock()
            .await
            .items
            .iter()
            .find(|row| row.item.bucket == bucket && row.item.key == key)
            .map(|row| row.state)
    }

    pub async fn job_stats(&self, bucket: &str, key: &str) -> Option<JobStats> {
        self.tables
            .lock()
            .await
            .items
            .iter()
            .find(|row| row.item.bucket == bucket && row.item.key == key)
            .and_then(|row| row.stats.clone())
    }

    pub async fn item_count(&self) -> usize {
        self.tables.lock().await.items.len()
    }

    /// Number of registered items not marked done yet.
    pub async fn outstanding(&self) -> usize {
        self.tables
            .lock()
            .await
            .items
            .iter()
            .filter(|row| !matches!(row.state, ItemState::Done { .. }))
            .count()
    }

    pub async fn last_heartbeat(&self) -> Option<OffsetDateTime> {
        self.tables.lock().await.last_heartbeat
    }
}

#[async_trait]
impl DataAccess for InMemoryDataAccess {
    async fn allocate_jobs(
        &self,
        out: &mut Vec<Job>,
        file_type: FileType,
        max_count: usize,
        recycle_seconds: u64,
        path_scope: Option<&str>,
    ) -> Result<usize> {
        self.check_available()?;
        let now = OffsetDateTime::now_utc();
        let recycle_after = time::Duration::seconds(recycle_seconds as i64);

        let mut tables = self.tables.lock().await;
        let Tables {
            items,
            next_load_id,
            ..
        } = &mut *tables;

        let mut allocated = 0;
        for row in items.iter_mut() {
            if allocated >= max_count {
                break;
            }
            if row.item.file_type != file_type {
                continue;
            }
            if path_scope.is_some_and(|scope| !row.item.key.starts_with(scope)) {
                continue;
            }
            let claimable = match row.state {
                ItemState::Pending => true,
                ItemState::Allocated { at, .. } => now - at >= recycle_after,
                ItemState::Done { .. } => false,
            };
            if !claimable {
                continue;
            }

            *next_load_id += 1;
            row.state = ItemState::Allocated {
                load_id: *next_load_id,
                at: now,
            };
            out.push(Job::new(
                &row.item.bucket,
                &row.item.key,
                row.item.file_type,
                row.bundle_id,
                row.version,
                *next_load_id,
            ));
            allocated += 1;
        }
        Ok(allocated)
    }

    async fn mark_job_done(&self, job: &Job, stats: &JobStats) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .items
            .iter_mut()
            .find(|row| row.bundle_id == job.bundle_id)
            .ok_or_else(|| {
                BucketError::data_access(format!("unknown bundle id {}", job.bundle_id))
            })?;
        // The object changed while this job ran; leave the new version pending.
        if row.version != job.version {
            return Ok(());
        }
        row.state = ItemState::Done {
            load_id: job.load_id,
        };
        row.stats = Some(stats.clone());
        Ok(())
    }

    async fn record_errors(
        &self,
        load_id: u64,
        line: Option<usize>,
        errors: &[String],
    ) -> Result<()> {
        let recorded_at = OffsetDateTime::now_utc();
        let mut tables = self.tables.lock().await;
        tables
            .errors
            .extend(errors.iter().map(|message| ResourceBundleError {
                load_id,
                line,
                message: message.clone(),
                recorded_at,
            }));
        Ok(())
    }

    async fn get_last_processed_line_number(
        &self,
        bundle_id: u64,
        version: u32,
    ) -> Result<Option<usize>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .refs
            .range((bundle_id, version, 0)..=(bundle_id, version, usize::MAX))
            .next_back()
            .map(|((_, _, line), _)| *line))
    }

    async fn get_resource_refs_for_line(
        &self,
        bundle_id: u64,
        version: u32,
        line: usize,
    ) -> Result<Vec<ResourceRef>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .refs
            .get(&(bundle_id, version, line))
            .cloned()
            .unwrap_or_default())
    }

    async fn record_resource_refs(
        &self,
        job: &Job,
        line: usize,
        refs: &[ResourceRef],
    ) -> Result<()> {
        if refs.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock().await;
        tables
            .refs
            .entry((job.bundle_id, job.version, line))
            .or_default()
            .extend_from_slice(refs);
        Ok(())
    }

    async fn register_bucket_item(&self, item: &BucketItem) -> Result<bool> {
        if item.file_type == FileType::Unknown {
            return Ok(false);
        }
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables
            .items
            .iter_mut()
            .find(|row| row.item.bucket == item.bucket && row.item.key == item.key)
        {
            if row.item.size == item.size {
                return Ok(false);
            }
            row.item = item.clone();
            row.version += 1;
            row.state = ItemState::Pending;
            row.stats = None;
            return Ok(true);
        }

        tables.next_bundle_id += 1;
        let bundle_id = tables.next_bundle_id;
        tables.items.push(ItemRow {
            bundle_id,
            item: item.clone(),
            version: 1,
            state: ItemState::Pending,
            stats: None,
        });
        Ok(true)
    }

    async fn heartbeat(&self) -> Result<()> {
        self.check_available()?;
        self.tables.lock().await.last_heartbeat = Some(OffsetDateTime::now_utc());
        Ok(())
    }
}
