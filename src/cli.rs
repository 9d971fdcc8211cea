use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "bulk_batcher")]
#[command(about = "Group NDJSON records into bounded per-partition batches for bulk ingestion")]
#[command(version)]
pub struct Args {
    /// Path to config YAML file (default: config.yaml in root)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// NDJSON input file (.ndjson or .ndjson.gz), or a directory of them
    /// Overrides config.yaml value if provided
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Staging directory for batches, failures and the run report
    /// Overrides config.yaml value if provided
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum records per batch
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Maximum cumulative bytes per batch
    #[arg(long)]
    pub max_bytes: Option<u64>,

    /// Top-level JSON field whose string value selects the partition
    #[arg(short, long)]
    pub partition_field: Option<String>,
}
