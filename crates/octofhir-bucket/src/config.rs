use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::FileType;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BucketConfig {
    #[serde(default)]
    pub bucket: BucketSettings,
    #[serde(default)]
    pub allocator: AllocatorSettings,
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub splitter: SplitterSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BucketConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.bucket.name.trim().is_empty() {
            return Err("bucket.name must not be empty".into());
        }
        if self.bucket.scan_interval_ms == 0 {
            return Err("bucket.scan_interval_ms must be > 0".into());
        }
        if self.bucket.heartbeat_interval_ms == 0 {
            return Err("bucket.heartbeat_interval_ms must be > 0".into());
        }
        // Allocator validations
        if self.allocator.max_inflight_jobs == 0 {
            return Err("allocator.max_inflight_jobs must be > 0".into());
        }
        if let Some(threshold) = self.allocator.rescan_threshold {
            if threshold == 0 {
                return Err("allocator.rescan_threshold must be > 0".into());
            }
            if threshold > self.allocator.max_inflight_jobs {
                return Err(
                    "allocator.rescan_threshold must be <= allocator.max_inflight_jobs".into(),
                );
            }
        }
        if self.allocator.file_types.is_empty() {
            return Err("allocator.file_types must not be empty".into());
        }
        for name in &self.allocator.file_types {
            match name.parse::<FileType>() {
                Ok(FileType::Unknown) | Err(_) => {
                    return Err(format!(
                        "allocator.file_types: unsupported file type '{name}' (expected ndjson or json)"
                    ));
                }
                Ok(_) => {}
            }
        }
        // Dispatcher validations
        if self.dispatcher.max_concurrent == 0 {
            return Err("dispatcher.max_concurrent must be > 0".into());
        }
        if !(self.dispatcher.bundle_cost_factor > 0.0) {
            return Err("dispatcher.bundle_cost_factor must be > 0".into());
        }
        if self.splitter.max_bundle_size == 0 {
            return Err("splitter.max_bundle_size must be > 0".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// File types with one allocator each, in configured order.
    pub fn file_types(&self) -> Vec<FileType> {
        self.allocator
            .file_types
            .iter()
            .filter_map(|name| name.parse().ok())
            .filter(|ft| *ft != FileType::Unknown)
            .collect()
    }

    /// Bucket the splitter writes fragments to.
    pub fn output_bucket(&self) -> &str {
        self.splitter
            .output_bucket
            .as_deref()
            .unwrap_or(&self.bucket.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketSettings {
    #[serde(default = "default_bucket_name")]
    pub name: String,
    /// Only keys under this prefix are scanned and allocated.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Directory backing the filesystem object store; each bucket is a sub-directory.
    #[serde(default = "default_root")]
    pub root: String,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_bucket_name() -> String {
    "fhir-bundles".into()
}
fn default_root() -> String {
    "./buckets".into()
}
fn default_scan_interval_ms() -> u64 {
    30_000
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            name: default_bucket_name(),
            prefix: None,
            root: default_root(),
            scan_interval_ms: default_scan_interval_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl BucketSettings {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorSettings {
    #[serde(default = "default_max_inflight_jobs")]
    pub max_inflight_jobs: usize,
    /// Defaults to half of `max_inflight_jobs` (at least 1).
    #[serde(default)]
    pub rescan_threshold: Option<usize>,
    /// Allocated jobs not finished after this long are handed out again.
    #[serde(default = "default_recycle_seconds")]
    pub recycle_seconds: u64,
    #[serde(default = "default_no_work_nap_ms")]
    pub no_work_nap_ms: u64,
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_file_types")]
    pub file_types: Vec<String>,
}

fn default_max_inflight_jobs() -> usize {
    10
}
fn default_recycle_seconds() -> u64 {
    600
}
fn default_no_work_nap_ms() -> u64 {
    5_000
}
fn default_error_backoff_ms() -> u64 {
    60_000
}
fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_file_types() -> Vec<String> {
    vec!["ndjson".into(), "json".into()]
}

impl Default for AllocatorSettings {
    fn default() -> Self {
        Self {
            max_inflight_jobs: default_max_inflight_jobs(),
            rescan_threshold: None,
            recycle_seconds: default_recycle_seconds(),
            no_work_nap_ms: default_no_work_nap_ms(),
            error_backoff_ms: default_error_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            file_types: default_file_types(),
        }
    }
}

impl AllocatorSettings {
    pub fn effective_rescan_threshold(&self) -> usize {
        self.rescan_threshold
            .unwrap_or_else(|| (self.max_inflight_jobs / 2).max(1))
    }

    pub fn no_work_nap(&self) -> Duration {
        Duration::from_millis(self.no_work_nap_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Cost units that may be processed at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_bundle_cost_factor")]
    pub bundle_cost_factor: f64,
}

fn default_max_concurrent() -> usize {
    40
}
fn default_bundle_cost_factor() -> f64 {
    1.0
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            bundle_cost_factor: default_bundle_cost_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamSettings {
    /// Skip NDJSON lines up to the last recorded line of a previous run.
    #[serde(default)]
    pub incremental: bool,
    /// Skip exactly the lines that already have recorded resources (one lookup per line).
    #[serde(default)]
    pub incremental_exact: bool,
    #[serde(default)]
    pub log_warnings: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,
    #[serde(default = "default_output_prefix")]
    pub output_prefix: String,
    #[serde(default)]
    pub output_bucket: Option<String>,
}

fn default_max_bundle_size() -> usize {
    100
}
fn default_output_prefix() -> String {
    "split".into()
}

impl Default for SplitterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_bundle_size: default_max_bundle_size(),
            output_prefix: default_output_prefix(),
            output_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

pub mod loader {
    use super::BucketConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "octofhir-bucket.toml";

    pub fn load_config(path: Option<&str>) -> Result<BucketConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            tracing::warn!(path = %pathbuf.display(), "Config file not found, using defaults");
        }
        // Environment variable overrides, e.g., OCTOFHIR_BUCKET__ALLOCATOR__MAX_INFLIGHT_JOBS=4
        builder = builder.add_source(
            Environment::with_prefix("OCTOFHIR_BUCKET")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: BucketConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}
