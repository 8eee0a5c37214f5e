use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "octofhir-bucket")]
#[command(about = "Load FHIR NDJSON and JSON objects from buckets")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the loader against the configured bucket
    Run(RunArgs),
    /// Split a transaction bundle file into smaller bundles
    Split(SplitArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct RunArgs {
    /// Config file (defaults to octofhir-bucket.toml)
    #[arg(short, long, env = "OCTOFHIR_BUCKET_CONFIG")]
    pub config: Option<String>,

    /// Load what is in the bucket now, then exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Args)]
pub struct SplitArgs {
    /// Bundle file; its name must end in .json
    pub input: PathBuf,

    /// Maximum entries per output bundle
    #[arg(long, default_value_t = 100)]
    pub max_bundle_size: usize,

    /// Directory the fragments are written to
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Config file (defaults to octofhir-bucket.toml)
    #[arg(short, long, env = "OCTOFHIR_BUCKET_CONFIG")]
    pub config: Option<String>,
}
