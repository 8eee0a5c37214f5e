//! Periodic bucket scan that registers new and changed objects.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::data_access::DataAccess;
use crate::error::Result;
use crate::job::FileType;
use crate::object_store::ObjectStore;
use crate::stop::{StopSignal, join_with_timeout, sleep_or_stop};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub seen: usize,
    pub registered: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct ScannerOptions {
    pub bucket: String,
    pub prefix: String,
    pub interval: Duration,
    pub stop_timeout: Duration,
}

struct Shared {
    options: ScannerOptions,
    object_store: Arc<dyn ObjectStore>,
    data_access: Arc<dyn DataAccess>,
    stop: StopSignal,
}

pub struct BucketScanner {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BucketScanner {
    pub fn new(
        options: ScannerOptions,
        object_store: Arc<dyn ObjectStore>,
        data_access: Arc<dyn DataAccess>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                options,
                object_store,
                data_access,
                stop: StopSignal::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Runs one scan and registers every NDJSON/JSON item found.
    pub async fn scan_once(&self) -> Result<ScanSummary> {
        scan_once(&self.shared).await
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *handle = Some(tokio::spawn(run(shared)));
    }

    pub fn signal_stop(&self) {
        self.shared.stop.signal();
    }

    pub async fn wait_for_stop(&self) {
        self.signal_stop();
        let handle = self.handle.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            join_with_timeout("scanner", handle, self.shared.options.stop_timeout).await;
        }
    }
}

async fn scan_once(shared: &Shared) -> Result<ScanSummary> {
    let options = &shared.options;
    let items = shared
        .object_store
        .scan(&options.bucket, &options.prefix, FileType::from_key)
        .await?;

    let mut summary = ScanSummary::default();
    for item in items {
        summary.seen += 1;
        if item.file_type == FileType::Unknown {
            debug!(key = %item.key, "Skipping bucket item of unknown type");
            summary.skipped += 1;
            continue;
        }
        if shared.data_access.register_bucket_item(&item).await? {
            debug!(key = %item.key, size = item.size, "Registered bucket item");
            summary.registered += 1;
        }
    }
    Ok(summary)
}

async fn run(shared: Arc<Shared>) {
    let mut stop_rx = shared.stop.subscribe();
    info!(
        bucket = %shared.options.bucket,
        prefix = %shared.options.prefix,
        interval_ms = shared.options.interval.as_millis() as u64,
        "Bucket scanner started"
    );
    while !shared.stop.is_stopped() {
        match scan_once(&shared).await {
            Ok(summary) if summary.registered > 0 => info!(
                seen = summary.seen,
                registered = summary.registered,
                "Bucket scan found new items"
            ),
            Ok(_) => {}
            Err(e) => error!(bucket = %shared.options.bucket, error = %e, "Bucket scan failed"),
        }
        if !sleep_or_stop(&mut stop_rx, shared.options.interval).await {
            break;
        }
    }
    info!("Bucket scanner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_access::InMemoryDataAccess;
    use crate::object_store::MemoryObjectStore;

    fn options() -> ScannerOptions {
        ScannerOptions {
            bucket: "b".into(),
            prefix: "in/".into(),
            interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_scan_registers_known_types() {
        let store = Arc::new(MemoryObjectStore::new());
        store.put("b", "in/a.ndjson", "{}");
        store.put("b", "in/b.json", "{}");
        store.put("b", "in/readme.md", "hi");
        store.put("b", "in/notes", "hi");
        store.put("b", "elsewhere/c.json", "{}");
        let da = Arc::new(InMemoryDataAccess::new());
        let scanner = BucketScanner::new(options(), store.clone(), da.clone());

        let summary = scanner.scan_once().await.unwrap();
        assert_eq!(
            summary,
            ScanSummary {
                seen: 4,
                registered: 2,
                skipped: 2
            }
        );
        assert_eq!(da.item_count().await, 2);

        // second scan finds nothing new
        assert_eq!(scanner.scan_once().await.unwrap().registered, 0);
    }

    #[tokio::test]
    async fn test_background_scan_and_stop() {
        let store = Arc::new(MemoryObjectStore::new());
        let da = Arc::new(InMemoryDataAccess::new());
        let scanner = BucketScanner::new(options(), store.clone(), da.clone());
        scanner.start();

        store.put("b", "in/late.ndjson", "{}");
        tokio::time::timeout(Duration::from_secs(5), async {
            while da.item_count().await == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), scanner.wait_for_stop())
            .await
            .unwrap();
    }
}
