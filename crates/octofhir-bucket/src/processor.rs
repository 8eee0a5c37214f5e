//! Resource processors run by the dispatcher for each entry.

use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::bundle::entries;
use octofhir_core::{BundleKind, EntryMethod, is_bundle, resource_id, resource_type};
use octofhir_storage::{DynStorage, StorageError, StoredResource};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::bundle::{
    BundleSplitter, LocalReferenceMap, addressed_reference, local_identifier, output_key,
    reference_id, resolve_local_identifiers, rewrite_resource,
};
use crate::data_access::{DataAccess, ResourceRef};
use crate::error::{BucketError, Result};
use crate::job::{FileType, Job, ResourceEntry};
use crate::object_store::ObjectStore;

#[async_trait]
pub trait ResourceProcessor: Send + Sync {
    async fn process(&self, entry: &ResourceEntry) -> Result<()>;

    fn name(&self) -> &'static str;
}

fn resource_ref(stored: &StoredResource) -> ResourceRef {
    ResourceRef::new(&stored.resource_type, &stored.id).with_version(&stored.version_id)
}

/// Persists resources through a [`FhirStorage`](octofhir_storage::FhirStorage).
///
/// Single resources are updated when they carry an id and created otherwise.
/// Transaction and batch bundles are executed entry by entry after their
/// local identifiers are resolved; other bundles are stored as resources.
pub struct StorageResourceProcessor {
    storage: DynStorage,
    data_access: Arc<dyn DataAccess>,
}

impl StorageResourceProcessor {
    pub fn new(storage: DynStorage, data_access: Arc<dyn DataAccess>) -> Self {
        Self {
            storage,
            data_access,
        }
    }

    async fn store(&self, resource: &Value) -> Result<ResourceRef> {
        let stored = match resource_id(resource) {
            Some(_) => self.storage.update(resource, None).await?,
            None => self.storage.create(resource).await?,
        };
        Ok(resource_ref(&stored))
    }

    /// Executes a transaction or batch bundle, collecting the written refs.
    ///
    /// A transaction stops at its first failing entry and reverts the entries
    /// it already wrote; a batch runs every entry and fails afterwards if any
    /// entry failed.
    async fn execute_bundle(
        &self,
        bundle: &Value,
        kind: &BundleKind,
        refs: &mut Vec<ResourceRef>,
    ) -> Result<()> {
        let bundle_entries = entries(bundle);
        let map = resolve_local_identifiers(bundle_entries);
        let mut journal = (*kind == BundleKind::Transaction).then(Vec::new);
        let mut failures = 0usize;

        for (index, entry) in bundle_entries.iter().enumerate() {
            match self.execute_entry(entry, &map, journal.as_mut()).await {
                Ok(Some(r)) => refs.push(r),
                Ok(None) => {}
                Err(e) => match journal.take() {
                    Some(undo) => {
                        self.rollback(undo).await;
                        refs.clear();
                        return Err(BucketError::invalid_bundle(format!(
                            "transaction entry {index} failed: {e}"
                        )));
                    }
                    None => {
                        warn!(index, error = %e, "Batch entry failed");
                        failures += 1;
                    }
                },
            }
        }

        if failures > 0 {
            return Err(BucketError::invalid_bundle(format!(
                "{failures} of {} batch entries failed",
                bundle_entries.len()
            )));
        }
        Ok(())
    }

    /// Captures how to put `resource_type/id` back the way it is now.
    async fn prior_state(&self, resource_type: &str, id: &str) -> Result<Undo> {
        match self.storage.read(resource_type, id).await {
            Ok(Some(stored)) => Ok(Undo::Restore(stored.resource)),
            Ok(None) => Ok(Undo::Erase(resource_type.to_string(), id.to_string())),
            Err(StorageError::Gone { .. }) => {
                Ok(Undo::Delete(resource_type.to_string(), id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remember(
        &self,
        journal: &mut Option<&mut Vec<Undo>>,
        resource: &Value,
    ) -> Result<()> {
        let Some(journal) = journal.as_deref_mut() else {
            return Ok(());
        };
        if let (Some(kind), Some(id)) = (resource_type(resource), resource_id(resource)) {
            journal.push(self.prior_state(kind, id).await?);
        }
        Ok(())
    }

    /// Reverts journaled writes, newest first.
    async fn rollback(&self, journal: Vec<Undo>) {
        let count = journal.len();
        for undo in journal.into_iter().rev() {
            let result = match &undo {
                Undo::Erase(resource_type, id) => {
                    self.storage.erase(resource_type, id).await.map(|_| ())
                }
                Undo::Restore(resource) => self.storage.update(resource, None).await.map(|_| ()),
                Undo::Delete(resource_type, id) => self.storage.delete(resource_type, id).await,
            };
            if let Err(e) = result {
                warn!(undo = ?undo, error = %e, "Failed to revert transaction entry");
            }
        }
        debug!(entries = count, "Reverted transaction");
    }

    async fn execute_entry(
        &self,
        entry: &Value,
        map: &LocalReferenceMap,
        mut journal: Option<&mut Vec<Undo>>,
    ) -> Result<Option<ResourceRef>> {
        let method = EntryMethod::of_entry(entry);
        let resource = entry.get("resource");

        match (method, resource) {
            (Some(EntryMethod::Post), Some(resource)) => {
                let new_id = local_identifier(entry)
                    .and_then(|local| map.get(local))
                    .and_then(|external| reference_id(external));
                let (resource, _) = rewrite_resource(resource, map, new_id);
                // Pre-assigned ids keep references to this entry valid.
                let stored = match new_id {
                    Some(_) => {
                        self.remember(&mut journal, &resource).await?;
                        self.storage.update(&resource, None).await?
                    }
                    None => {
                        let stored = self.storage.create(&resource).await?;
                        if let Some(journal) = journal {
                            journal.push(Undo::Erase(
                                stored.resource_type.clone(),
                                stored.id.clone(),
                            ));
                        }
                        stored
                    }
                };
                Ok(Some(resource_ref(&stored)))
            }
            (Some(EntryMethod::Put), Some(resource)) => {
                let (mut resource, _) = rewrite_resource(resource, map, None);
                if resource_id(&resource).is_none() {
                    let target = addressed_reference(entry);
                    if let (Some(target), Some(obj)) = (target, resource.as_object_mut()) {
                        obj.insert("id".to_string(), Value::String(target.id));
                    }
                }
                self.remember(&mut journal, &resource).await?;
                let stored = self.storage.update(&resource, None).await?;
                Ok(Some(resource_ref(&stored)))
            }
            (Some(EntryMethod::Delete), _) => {
                let target = addressed_reference(entry).ok_or_else(|| {
                    BucketError::invalid_bundle("DELETE entry without a target reference")
                })?;
                if let Some(journal) = journal.as_deref_mut() {
                    match self.storage.read(&target.resource_type, &target.id).await {
                        Ok(Some(stored)) => journal.push(Undo::Restore(stored.resource)),
                        Ok(None) | Err(StorageError::Gone { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                match self.storage.delete(&target.resource_type, &target.id).await {
                    Ok(()) => Ok(None),
                    Err(StorageError::NotFound { .. }) => {
                        debug!(target = %target, "DELETE of missing resource");
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            (Some(EntryMethod::Post | EntryMethod::Put), None) => Err(BucketError::invalid_bundle(
                "POST/PUT entry without a resource",
            )),
            (other, _) => {
                debug!(method = ?other, "Skipping bundle entry with unsupported method");
                Ok(None)
            }
        }
    }
}

/// How to revert one write made by a transaction entry.
#[derive(Debug)]
enum Undo {
    /// The resource did not exist.
    Erase(String, String),
    /// The resource held this content.
    Restore(Value),
    /// The resource was deleted.
    Delete(String, String),
}

#[async_trait]
impl ResourceProcessor for StorageResourceProcessor {
    async fn process(&self, entry: &ResourceEntry) -> Result<()> {
        let mut refs = Vec::new();
        let outcome = match BundleKind::of(&entry.resource) {
            Some(kind @ (BundleKind::Transaction | BundleKind::Batch))
                if is_bundle(&entry.resource) =>
            {
                self.execute_bundle(&entry.resource, &kind, &mut refs).await
            }
            _ => self.store(&entry.resource).await.map(|r| refs.push(r)),
        };

        // Only a persisted line counts as loaded for incremental reloads.
        if outcome.is_ok() {
            if let Err(e) = self
                .data_access
                .record_resource_refs(entry.job(), entry.line, &refs)
                .await
            {
                warn!(line = entry.line, error = %e, "Failed to record resource refs");
            }
        }
        outcome
    }

    fn name(&self) -> &'static str {
        "storage"
    }
}

/// Splits oversized transaction bundles into fragments written back to the
/// object store; every other resource goes to the inner processor.
pub struct BundleBreakerProcessor {
    splitter: BundleSplitter,
    object_store: Arc<dyn ObjectStore>,
    output_bucket: String,
    output_prefix: String,
    inner: Arc<dyn ResourceProcessor>,
}

impl BundleBreakerProcessor {
    pub fn new(
        splitter: BundleSplitter,
        object_store: Arc<dyn ObjectStore>,
        output_bucket: impl Into<String>,
        output_prefix: impl Into<String>,
        inner: Arc<dyn ResourceProcessor>,
    ) -> Self {
        Self {
            splitter,
            object_store,
            output_bucket: output_bucket.into(),
            output_prefix: output_prefix.into(),
            inner,
        }
    }
}

/// Name a bundle is split under: the object key for JSON objects, and
/// `{stem}_{line:05}.json` for a bundle on an NDJSON line.
fn source_name(job: &Job, line: usize) -> String {
    match job.file_type {
        FileType::Ndjson => {
            let stem = job
                .key
                .strip_suffix(".ndjson")
                .or_else(|| job.key.strip_suffix(".NDJSON"))
                .unwrap_or(&job.key);
            format!("{stem}_{line:05}.json")
        }
        _ => job.key.clone(),
    }
}

#[async_trait]
impl ResourceProcessor for BundleBreakerProcessor {
    async fn process(&self, entry: &ResourceEntry) -> Result<()> {
        let is_transaction = is_bundle(&entry.resource)
            && BundleKind::of(&entry.resource) == Some(BundleKind::Transaction);
        // Small enough bundles are loaded directly, which also covers
        // fragments written by an earlier split.
        if !is_transaction || entries(&entry.resource).len() <= self.splitter.max_bundle_size() {
            return self.inner.process(entry).await;
        }

        let name = source_name(entry.job(), entry.line);
        let fragments = self.splitter.split(&name, &entry.resource)?;
        for fragment in &fragments {
            let key = output_key(&self.output_prefix, &fragment.name);
            let payload = serde_json::to_string(&fragment.bundle)?;
            self.object_store
                .write(&self.output_bucket, &key, &payload)
                .await?;
        }
        info!(
            name = %name,
            bucket = %self.output_bucket,
            fragments = fragments.len(),
            "Wrote bundle fragments"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "bundle-breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_access::InMemoryDataAccess;
    use crate::job::JobTracker;
    use crate::object_store::MemoryObjectStore;
    use octofhir_db_memory::InMemoryStorage;
    use octofhir_storage::{FhirStorage, SearchParams};
    use serde_json::json;

    fn entry(key: &str, file_type: FileType, resource: Value, line: usize) -> ResourceEntry {
        let (tracker, _done) = JobTracker::new(Job::new("b", key, file_type, 1, 1, 1));
        ResourceEntry {
            tracker,
            resource,
            line,
            cost: 1,
        }
    }

    fn setup() -> (Arc<InMemoryStorage>, Arc<InMemoryDataAccess>, StorageResourceProcessor) {
        let storage = Arc::new(InMemoryStorage::new());
        let da = Arc::new(InMemoryDataAccess::new());
        let processor = StorageResourceProcessor::new(storage.clone(), da.clone());
        (storage, da, processor)
    }

    #[tokio::test]
    async fn test_store_single_resources() {
        let (storage, da, processor) = setup();
        processor
            .process(&entry(
                "a.ndjson",
                FileType::Ndjson,
                json!({"resourceType": "Patient", "id": "p1"}),
                3,
            ))
            .await
            .unwrap();
        processor
            .process(&entry(
                "a.ndjson",
                FileType::Ndjson,
                json!({"resourceType": "Patient"}),
                4,
            ))
            .await
            .unwrap();

        assert!(storage.read("Patient", "p1").await.unwrap().is_some());
        assert_eq!(storage.live_count().await, 2);
        let refs = da.get_resource_refs_for_line(1, 1, 3).await.unwrap();
        assert_eq!(refs, vec![ResourceRef::new("Patient", "p1").with_version("1")]);
    }

    #[tokio::test]
    async fn test_transaction_resolves_local_references() {
        let (storage, _da, processor) = setup();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {
                    "fullUrl": "urn:uuid:obs",
                    "resource": {"resourceType": "Observation", "subject": {"reference": "urn:uuid:pat"}},
                    "request": {"method": "POST", "url": "Observation"}
                },
                {
                    "fullUrl": "urn:uuid:pat",
                    "resource": {"resourceType": "Patient"},
                    "request": {"method": "POST", "url": "Patient"}
                }
            ]
        });
        processor
            .process(&entry("t.json", FileType::Json, bundle, 0))
            .await
            .unwrap();

        let patients = storage.search("Patient", &SearchParams::new()).await.unwrap();
        assert_eq!(patients.len(), 1);
        let patient_ref = format!("Patient/{}", patients.entries[0].id);
        let obs = storage
            .search("Observation", &SearchParams::new().with_param("subject", patient_ref))
            .await
            .unwrap();
        assert_eq!(obs.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_is_reverted_and_not_recorded() {
        let (storage, da, processor) = setup();
        storage
            .update(&json!({"resourceType": "Patient", "id": "kept", "active": true}), None)
            .await
            .unwrap();
        storage
            .update(&json!({"resourceType": "Patient", "id": "gone"}), None)
            .await
            .unwrap();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"fullUrl": "urn:uuid:new", "resource": {"resourceType": "Patient"}, "request": {"method": "POST", "url": "Patient"}},
                {"resource": {"resourceType": "Patient"}, "request": {"method": "POST", "url": "Patient"}},
                {"resource": {"resourceType": "Patient", "id": "kept", "active": false}, "request": {"method": "PUT", "url": "Patient/kept"}},
                {"request": {"method": "DELETE", "url": "Patient/gone"}},
                {"request": {"method": "PUT", "url": "Patient/broken"}}
            ]
        });
        let err = processor
            .process(&entry("t.ndjson", FileType::Ndjson, bundle, 3))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("entry 4"));

        // nothing from the bundle survives
        assert_eq!(storage.live_count().await, 2);
        let kept = storage.read("Patient", "kept").await.unwrap().unwrap();
        assert_eq!(kept.resource["active"], true);
        assert!(storage.read("Patient", "gone").await.unwrap().is_some());

        // the line is not treated as loaded
        assert!(da.get_resource_refs_for_line(1, 1, 3).await.unwrap().is_empty());
        assert_eq!(da.get_last_processed_line_number(1, 1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_batch_reports_failed_entries() {
        let (storage, _da, processor) = setup();
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "batch",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "ok"}, "request": {"method": "PUT", "url": "Patient/ok"}},
                {"request": {"method": "POST", "url": "Patient"}},
                {"request": {"method": "DELETE", "url": "Patient/missing"}}
            ]
        });
        let err = processor
            .process(&entry("b.json", FileType::Json, bundle, 0))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("1 of 3"));
        assert!(storage.read("Patient", "ok").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_bundle_breaker_writes_fragments() {
        let (storage, da, storage_processor) = setup();
        let store = Arc::new(MemoryObjectStore::new());
        let breaker = BundleBreakerProcessor::new(
            BundleSplitter::new(1),
            store.clone(),
            "out",
            "split",
            Arc::new(storage_processor),
        );
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"fullUrl": "urn:uuid:1", "resource": {"resourceType": "Patient"}, "request": {"method": "POST", "url": "Patient"}},
                {"fullUrl": "urn:uuid:2", "resource": {"resourceType": "Patient"}, "request": {"method": "POST", "url": "Patient"}}
            ]
        });
        breaker
            .process(&entry("in/big.ndjson", FileType::Ndjson, bundle, 7))
            .await
            .unwrap();
        assert_eq!(
            store.keys("out"),
            vec![
                "split/in/big_00007_SUB000.json".to_string(),
                "split/in/big_00007_SUB001.json".to_string()
            ]
        );

        // non-bundles go to the inner processor
        breaker
            .process(&entry(
                "in/p.ndjson",
                FileType::Ndjson,
                json!({"resourceType": "Patient", "id": "x"}),
                0,
            ))
            .await
            .unwrap();
        assert_eq!(da.get_resource_refs_for_line(1, 1, 0).await.unwrap().len(), 1);

        // a transaction within the limit is loaded, not rewritten
        let small = json!({
            "resourceType": "Bundle",
            "type": "transaction",
            "entry": [
                {"resource": {"resourceType": "Patient", "id": "s1"}, "request": {"method": "PUT", "url": "Patient/s1"}}
            ]
        });
        breaker
            .process(&entry("split/in/big_00007_SUB000.json", FileType::Json, small, 0))
            .await
            .unwrap();
        assert!(storage.read("Patient", "s1").await.unwrap().is_some());
        assert_eq!(store.keys("out").len(), 2);
    }
}
