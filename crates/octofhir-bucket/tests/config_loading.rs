//! Config file and environment override loading.
//!
//! Kept in one test so the process environment is not shared between
//! parallel tests.

use octofhir_bucket::FileType;
use octofhir_bucket::config::loader::load_config;

#[test]
fn test_file_then_environment_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loader.toml");
    std::fs::write(
        &path,
        r#"
        [bucket]
        name = "incoming"
        prefix = "2024/"

        [allocator]
        max_inflight_jobs = 8
        file_types = ["ndjson"]

        [logging]
        level = "debug"
        "#,
    )
    .unwrap();
    let path = path.to_str().unwrap().to_string();

    let cfg = load_config(Some(&path)).unwrap();
    assert_eq!(cfg.bucket.name, "incoming");
    assert_eq!(cfg.allocator.max_inflight_jobs, 8);
    assert_eq!(cfg.allocator.effective_rescan_threshold(), 4);
    assert_eq!(cfg.file_types(), vec![FileType::Ndjson]);
    assert_eq!(cfg.logging.level, "debug");

    // SAFETY: no other test in this binary touches the environment.
    unsafe {
        std::env::set_var("OCTOFHIR_BUCKET__ALLOCATOR__MAX_INFLIGHT_JOBS", "3");
        std::env::set_var("OCTOFHIR_BUCKET__SPLITTER__ENABLED", "true");
    }
    let cfg = load_config(Some(&path)).unwrap();
    assert_eq!(cfg.allocator.max_inflight_jobs, 3);
    assert_eq!(cfg.allocator.effective_rescan_threshold(), 1);
    assert!(cfg.splitter.enabled);
    assert_eq!(cfg.output_bucket(), "incoming");

    // an override that breaks validation is reported
    unsafe {
        std::env::set_var("OCTOFHIR_BUCKET__ALLOCATOR__MAX_INFLIGHT_JOBS", "0");
    }
    let err = load_config(Some(&path)).unwrap_err();
    assert!(err.contains("max_inflight_jobs"));

    unsafe {
        std::env::remove_var("OCTOFHIR_BUCKET__ALLOCATOR__MAX_INFLIGHT_JOBS");
        std::env::remove_var("OCTOFHIR_BUCKET__SPLITTER__ENABLED");
    }

    // a missing file falls back to defaults
    let missing = dir.path().join("absent.toml");
    let cfg = load_config(missing.to_str()).unwrap();
    assert_eq!(cfg.bucket.name, "fhir-bundles");
}
