//! Object store access.
//!
//! Buckets hold objects addressed by `/`-separated keys. The loader reads
//! objects as buffered streams, scans buckets for new items and writes split
//! bundle fragments back.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, BufReader};

use crate::error::{BucketError, Result};
use crate::job::FileType;

/// A readable object stream, valid for as long as the caller holds it.
pub type ObjectReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Classifies an object key.
pub type KeyTyper = fn(&str) -> FileType;

/// An object found by a bucket scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketItem {
    pub bucket: String,
    pub key: String,
    pub file_type: FileType,
    pub size: u64,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Opens an object for reading.
    async fn read_object(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    /// Lists objects under `prefix`, sorted by key, classifying each with `typer`.
    ///
    /// Returns [`BucketError::Stopped`] if [`ObjectStore::signal_stop`] was
    /// called before or during the scan.
    async fn scan(&self, bucket: &str, prefix: &str, typer: KeyTyper) -> Result<Vec<BucketItem>>;

    /// Stores a UTF-8 payload, replacing any existing object.
    async fn write(&self, bucket: &str, key: &str, payload: &str) -> Result<()>;

    /// Cancels in-progress and future scans and reads.
    fn signal_stop(&self);

    fn backend_name(&self) -> &'static str;
}

/// Object store kept in memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<(String, String), Vec<u8>>>,
    stopped: AtomicBool,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, payload: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert((bucket.to_string(), key.to_string()), payload.into());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<String> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Keys of all objects in `bucket`.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect()
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BucketError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read_object(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        self.check_running()?;
        let bytes = self
            .objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| BucketError::object_store(format!("object not found: {bucket}/{key}")))?;
        Ok(Box::new(std::io::Cursor::new(bytes)))
    }

    async fn scan(&self, bucket: &str, prefix: &str, typer: KeyTyper) -> Result<Vec<BucketItem>> {
        self.check_running()?;
        let objects = self
            .objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((b, k), bytes)| BucketItem {
                bucket: b.clone(),
                key: k.clone(),
                file_type: typer(k),
                size: bytes.len() as u64,
            })
            .collect())
    }

    async fn write(&self, bucket: &str, key: &str, payload: &str) -> Result<()> {
        self.put(bucket, key, payload.as_bytes());
        Ok(())
    }

    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Object store on the local filesystem: each bucket is a directory under `root`.
#[derive(Debug)]
pub struct FsObjectStore {
    root: PathBuf,
    stopped: AtomicBool,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(checked_segment(bucket)?);
        for segment in key.split('/').filter(|s| !s.is_empty()) {
            path.push(checked_segment(segment)?);
        }
        Ok(path)
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(BucketError::Stopped);
        }
        Ok(())
    }
}

/// Rejects path segments that would escape the bucket directory.
fn checked_segment(segment: &str) -> Result<&str> {
    let mut components = Path::new(segment).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(segment),
        _ => Err(BucketError::object_store(format!(
            "invalid object path segment: {segment:?}"
        ))),
    }
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> BucketError {
    BucketError::object_store(format!("{context} {}: {err}", path.display()))
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn read_object(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        self.check_running()?;
        let path = self.object_path(bucket, key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error("cannot open", &path, e))?;
        Ok(Box::new(BufReader::new(file)))
    }

    async fn scan(&self, bucket: &str, prefix: &str, typer: KeyTyper) -> Result<Vec<BucketItem>> {
        let bucket_dir = self.root.join(checked_segment(bucket)?);
        let mut items = Vec::new();
        let mut pending = vec![(bucket_dir.clone(), String::new())];

        while let Some((dir, dir_key)) = pending.pop() {
            self.check_running()?;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && dir == bucket_dir => {
                    tracing::debug!(bucket, "Bucket directory does not exist yet");
                    return Ok(items);
                }
                Err(e) => return Err(io_error("cannot list", &dir, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| io_error("cannot list", &dir, e))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = if dir_key.is_empty() {
                    name
                } else {
                    format!("{dir_key}/{name}")
                };
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| io_error("cannot stat", &entry.path(), e))?;
                if metadata.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    items.push(BucketItem {
                        bucket: bucket.to_string(),
                        file_type: typer(&key),
                        key,
                        size: metadata.len(),
                    });
                }
            }
        }

        items.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(items)
    }

    async fn write(&self, bucket: &str, key: &str, payload: &str) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("cannot create", parent, e))?;
        }
        tokio::fs::write(&path, payload)
            .await
            .map_err(|e| io_error("cannot write", &path, e))
    }

    fn signal_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}
