mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use octofhir_bucket::config::loader::load_config;
use octofhir_bucket::observability::{apply_logging_level, init_tracing};
use octofhir_bucket::{
    BucketLoader, BundleSplitter, FsObjectStore, InMemoryDataAccess, ObjectStore, build_processor,
};
use octofhir_db_memory::InMemoryStorage;

use cli::{Cli, Commands, RunArgs, SplitArgs};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
        {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    init_tracing();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_loader(args).await,
        Commands::Split(args) => split_file(args).await,
        Commands::Config(args) => {
            let cfg = load_or_exit(args.config.as_deref());
            print!("{}", toml::to_string_pretty(&cfg)?);
            Ok(())
        }
    }
}

fn load_or_exit(path: Option<&str>) -> octofhir_bucket::BucketConfig {
    match load_config(path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(2);
        }
    }
}

async fn run_loader(args: RunArgs) -> Result<()> {
    let cfg = load_or_exit(args.config.as_deref());
    apply_logging_level(&cfg.logging.level);
    tracing::info!(
        bucket = %cfg.bucket.name,
        root = %cfg.bucket.root,
        splitter = cfg.splitter.enabled,
        "Configuration loaded"
    );

    let object_store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&cfg.bucket.root));
    let data_access = Arc::new(InMemoryDataAccess::new());
    let storage = Arc::new(InMemoryStorage::new());
    let processor = build_processor(&cfg, storage.clone(), object_store.clone(), data_access.clone());
    let poll = cfg.allocator.no_work_nap().min(Duration::from_millis(500));
    let loader = BucketLoader::new(cfg, object_store, data_access.clone(), processor)?;

    if args.once {
        loader.scan_once().await?;
        loader.start();
        // Fragments written by the splitter show up on a later scan.
        loop {
            tokio::time::sleep(poll).await;
            if data_access.outstanding().await == 0 && loader.scan_once().await?.registered == 0 {
                break;
            }
        }
    } else {
        loader.start();
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl-C")?;
        tracing::info!("Shutdown requested");
    }

    loader.wait_for_stop().await;
    let errors = data_access.errors().await;
    tracing::info!(
        resources = storage.live_count().await,
        errors = errors.len(),
        "Load finished"
    );
    Ok(())
}

async fn split_file(args: SplitArgs) -> Result<()> {
    let name = args
        .input
        .file_name()
        .and_then(|n| n.to_str())
        .context("input path has no file name")?
        .to_string();
    let text = tokio::fs::read_to_string(&args.input)
        .await
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let bundle: serde_json::Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", args.input.display()))?;

    let fragments = BundleSplitter::new(args.max_bundle_size).split(&name, &bundle)?;
    tokio::fs::create_dir_all(&args.output_dir).await?;
    for fragment in &fragments {
        let path = args.output_dir.join(&fragment.name);
        let payload = serde_json::to_string_pretty(&fragment.bundle)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        tracing::info!(path = %path.display(), entries = fragment.entry_count(), "Wrote fragment");
    }
    Ok(())
}
