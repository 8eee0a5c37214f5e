//! End-to-end loader tests against in-memory stores.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use octofhir_bucket::config::StreamSettings;
use octofhir_bucket::data_access::ItemState;
use octofhir_bucket::{
    BasicResourceValidator, BucketConfig, BucketLoader, DataAccess, FileType, InMemoryDataAccess,
    Job, JobTracker, MemoryObjectStore, ResourceDispatcher, ResourceEntry, ResourceProcessor,
    ResourceRef, StreamProcessor, build_processor,
};
use octofhir_db_memory::InMemoryStorage;
use octofhir_storage::{FhirStorage, SearchParams};
use serde_json::json;
use tokio::time::timeout;

/// Counts processed entries and remembers their lines.
#[derive(Default)]
struct CountingProcessor {
    calls: AtomicUsize,
    lines: std::sync::Mutex<Vec<usize>>,
}

#[async_trait]
impl ResourceProcessor for CountingProcessor {
    async fn process(&self, entry: &ResourceEntry) -> octofhir_bucket::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.lines.lock().unwrap().push(entry.line);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "counting"
    }
}

fn stream_processor(
    da: &Arc<InMemoryDataAccess>,
    processor: Arc<CountingProcessor>,
    settings: StreamSettings,
) -> StreamProcessor {
    let dispatcher = Arc::new(ResourceDispatcher::new(4, processor, da.clone()));
    StreamProcessor::new(
        da.clone(),
        Arc::new(BasicResourceValidator),
        dispatcher,
        settings,
        1.0,
    )
}

#[tokio::test]
async fn test_bad_line_is_isolated() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let stream = stream_processor(&da, processor.clone(), StreamSettings::default());
    let (tracker, done) = JobTracker::new(Job::new("b", "p.ndjson", FileType::Ndjson, 1, 1, 42));

    let input = concat!(
        "{\"resourceType\":\"Patient\",\"id\":\"a\"}\n",
        "{\"resourceType\":\"Patient\",\"id\":\n",
        "{\"resourceType\":\"Patient\",\"id\":\"c\"}\n",
    );
    let summary = stream.process(&tracker, input.as_bytes()).await.unwrap();
    assert_eq!(summary.lines_read, 3);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.errors, 1);

    let stats = timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
    assert_eq!(stats.entries_completed, 2);
    assert_eq!(stats.line_errors, 1);

    let errors = da.errors().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].load_id, 42);
    assert_eq!(errors[0].line, Some(1));
    assert_eq!(processor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_invalid_utf8_line_is_isolated() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let stream = stream_processor(&da, processor.clone(), StreamSettings::default());
    let (tracker, done) = JobTracker::new(Job::new("b", "p.ndjson", FileType::Ndjson, 1, 1, 9));

    let mut input = b"{\"resourceType\":\"Patient\",\"id\":\"a\"}\r\n".to_vec();
    input.extend_from_slice(b"{\"resourceType\":\"Patient\",\"name\":\"\xff\xfe\"}\n");
    input.extend_from_slice(b"{\"resourceType\":\"Patient\",\"id\":\"c\"}");
    let summary = stream.process(&tracker, input.as_slice()).await.unwrap();
    assert_eq!(summary.lines_read, 3);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.errors, 1);

    let stats = timeout(Duration::from_secs(5), done).await.unwrap().unwrap();
    assert_eq!(stats.entries_completed, 2);
    assert_eq!(stats.line_errors, 1);

    let errors = da.errors().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, Some(1));
    assert!(errors[0].message.contains("UTF-8"));
    let mut lines = processor.lines.lock().unwrap().clone();
    lines.sort_unstable();
    assert_eq!(lines, vec![0, 2]);
}

#[tokio::test]
async fn test_invalid_resource_is_recorded() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let stream = stream_processor(&da, processor.clone(), StreamSettings::default());
    let (tracker, _done) = JobTracker::new(Job::new("b", "p.ndjson", FileType::Ndjson, 1, 1, 1));

    let input = "{\"id\":\"no-type\"}\n\n{\"resourceType\":\"Patient\"}\n";
    let summary = stream.process(&tracker, input.as_bytes()).await.unwrap();
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(da.errors().await[0].line, Some(0));
}

async fn record_lines(da: &InMemoryDataAccess, job: &Job, lines: &[usize]) {
    for line in lines {
        da.record_resource_refs(job, *line, &[ResourceRef::new("Patient", format!("p{line}"))])
            .await
            .unwrap();
    }
}

const FOUR_PATIENTS: &str = concat!(
    "{\"resourceType\":\"Patient\",\"id\":\"p0\"}\n",
    "{\"resourceType\":\"Patient\",\"id\":\"p1\"}\n",
    "{\"resourceType\":\"Patient\",\"id\":\"p2\"}\n",
    "{\"resourceType\":\"Patient\",\"id\":\"p3\"}\n",
);

#[tokio::test]
async fn test_incremental_skips_up_to_last_line() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let settings = StreamSettings {
        incremental: true,
        ..Default::default()
    };
    let stream = stream_processor(&da, processor.clone(), settings);
    let job = Job::new("b", "p.ndjson", FileType::Ndjson, 7, 2, 1);
    record_lines(&da, &job, &[0, 2]).await;

    let (tracker, done) = JobTracker::new(job);
    let summary = stream.process(&tracker, FOUR_PATIENTS.as_bytes()).await.unwrap();
    timeout(Duration::from_secs(5), done).await.unwrap().unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.dispatched, 1);
    assert_eq!(*processor.lines.lock().unwrap(), vec![3]);
}

#[tokio::test]
async fn test_incremental_exact_skips_recorded_lines_only() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let settings = StreamSettings {
        incremental_exact: true,
        ..Default::default()
    };
    let stream = stream_processor(&da, processor.clone(), settings);
    let job = Job::new("b", "p.ndjson", FileType::Ndjson, 7, 2, 1);
    record_lines(&da, &job, &[0, 2]).await;

    let (tracker, done) = JobTracker::new(job);
    let summary = stream.process(&tracker, FOUR_PATIENTS.as_bytes()).await.unwrap();
    timeout(Duration::from_secs(5), done).await.unwrap().unwrap();

    assert_eq!(summary.skipped, 2);
    let mut lines = processor.lines.lock().unwrap().clone();
    lines.sort_unstable();
    assert_eq!(lines, vec![1, 3]);
}

#[tokio::test]
async fn test_incremental_ignores_other_versions() {
    let da = Arc::new(InMemoryDataAccess::new());
    let processor = Arc::new(CountingProcessor::default());
    let settings = StreamSettings {
        incremental: true,
        ..Default::default()
    };
    let stream = stream_processor(&da, processor.clone(), settings);
    let old = Job::new("b", "p.ndjson", FileType::Ndjson, 7, 1, 1);
    record_lines(&da, &old, &[0, 1, 2, 3]).await;

    let (tracker, _done) = JobTracker::new(Job::new("b", "p.ndjson", FileType::Ndjson, 7, 2, 2));
    let summary = stream.process(&tracker, FOUR_PATIENTS.as_bytes()).await.unwrap();
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.dispatched, 4);
}

fn loader_config() -> BucketConfig {
    let mut config = BucketConfig::default();
    config.bucket.name = "in".into();
    config.bucket.scan_interval_ms = 20;
    config.bucket.heartbeat_interval_ms = 50;
    config.allocator.max_inflight_jobs = 2;
    config.allocator.no_work_nap_ms = 10;
    config.dispatcher.max_concurrent = 4;
    config.splitter.enabled = true;
    config.splitter.max_bundle_size = 2;
    config
}

#[tokio::test]
async fn test_full_load_with_split_bundle() {
    let store = Arc::new(MemoryObjectStore::new());
    store.put(
        "in",
        "patients.ndjson",
        concat!(
            "{\"resourceType\":\"Patient\",\"id\":\"n1\"}\n",
            "not json\n",
            "{\"resourceType\":\"Patient\",\"id\":\"n2\"}\n",
        ),
    );
    let tx = json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": [
            {"fullUrl": "urn:uuid:o1", "resource": {"resourceType": "Observation", "status": "final", "subject": {"reference": "urn:uuid:pat"}}, "request": {"method": "POST", "url": "Observation"}},
            {"fullUrl": "urn:uuid:o2", "resource": {"resourceType": "Observation", "status": "final", "subject": {"reference": "urn:uuid:pat"}}, "request": {"method": "POST", "url": "Observation"}},
            {"fullUrl": "urn:uuid:o3", "resource": {"resourceType": "Observation", "status": "final", "subject": {"reference": "urn:uuid:pat"}}, "request": {"method": "POST", "url": "Observation"}},
            {"fullUrl": "urn:uuid:pat", "resource": {"resourceType": "Patient"}, "request": {"method": "POST", "url": "Patient"}},
            {"fullUrl": "urn:uuid:fixed", "resource": {"resourceType": "Patient", "id": "fixed"}, "request": {"method": "PUT", "url": "Patient/fixed"}}
        ]
    });
    store.put("in", "tx.json", tx.to_string());
    store.put("in", "README.txt", "ignored");

    let da = Arc::new(InMemoryDataAccess::new());
    let storage = Arc::new(InMemoryStorage::new());
    let config = loader_config();
    let processor = build_processor(&config, storage.clone(), store.clone(), da.clone());
    let loader = BucketLoader::new(config, store.clone(), da.clone(), processor).unwrap();
    loader.start();

    // two source objects plus three fragments
    timeout(Duration::from_secs(10), async {
        while da.item_count().await < 5 || da.outstanding().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("load did not finish");
    loader.wait_for_stop().await;

    assert_eq!(
        store.keys("in").iter().filter(|k| k.starts_with("split/")).count(),
        3
    );
    assert!(matches!(
        da.item_state("in", "tx.json").await,
        Some(ItemState::Done { .. })
    ));

    // NDJSON line errors do not fail the object
    let stats = da.job_stats("in", "patients.ndjson").await.unwrap();
    assert_eq!(stats.entries_completed, 2);
    assert_eq!(stats.line_errors, 1);
    let errors = da.errors().await;
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].line, Some(1));

    // every observation points at the patient created from the same bundle
    let patients = storage.search("Patient", &SearchParams::new()).await.unwrap();
    assert_eq!(patients.len(), 4);
    let observations = storage
        .search("Observation", &SearchParams::new())
        .await
        .unwrap();
    assert_eq!(observations.len(), 3);
    for obs in &observations.entries {
        let subject = obs.resource["subject"]["reference"].as_str().unwrap();
        let id = subject.strip_prefix("Patient/").unwrap();
        assert!(storage.read("Patient", id).await.unwrap().is_some());
    }
    assert!(storage.read("Patient", "fixed").await.unwrap().is_some());
}

#[tokio::test]
async fn test_loader_stops_promptly_with_work_pending() {
    let store = Arc::new(MemoryObjectStore::new());
    for i in 0..20 {
        store.put("in", &format!("f{i:02}.ndjson"), "{\"resourceType\":\"Patient\"}\n");
    }
    let da = Arc::new(InMemoryDataAccess::new());
    let mut config = loader_config();
    config.allocator.stop_timeout_ms = 500;
    let processor = build_processor(
        &config,
        Arc::new(InMemoryStorage::new()),
        store.clone(),
        da.clone(),
    );
    let loader = BucketLoader::new(config, store, da.clone(), processor).unwrap();
    loader.start();
    tokio::time::sleep(Duration::from_millis(30)).await;

    timeout(Duration::from_secs(5), loader.wait_for_stop())
        .await
        .expect("stop hung");
    assert!(da.item_count().await <= 20);
}
