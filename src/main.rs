mod cli;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use clap::Parser;
use glob::glob;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bulk_batcher::config::{Settings, CONFIG_VERSION};
use bulk_batcher::metrics::Metrics;
use bulk_batcher::pipeline::deliver_pipelined;
use bulk_batcher::report::{RunReport, RunStatus};
use bulk_batcher::sink::staging::{FailureLog, StagingSubmitter};
use bulk_batcher::source::ndjson::open_ndjson;

use crate::cli::Args;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Load settings from YAML, with CLI overrides
    let mut settings = Settings::load_from_yaml(args.config.as_deref())?;
    settings = settings.merge_with_cli(
        args.input,
        args.output,
        args.max_items,
        args.max_bytes,
        args.partition_field,
    );

    // Resolve paths relative to current working directory (project root)
    let root = env::current_dir()?;
    settings.resolve_paths(&root);

    init_logging(&settings.logging.log_level);

    match &settings.loaded_from {
        Some(path) => info!(path = %path.display(), version = %settings.version, "Loaded config"),
        None => info!("Config file not found, using defaults"),
    }
    if settings.version != CONFIG_VERSION {
        warn!(
            expected = CONFIG_VERSION,
            found = %settings.version,
            "Config version mismatch, continuing with current schema"
        );
    }

    settings.batching.validate()?;
    let input_path = settings.input_path()?.to_path_buf();
    let output_dir = settings.storage.output_path.clone();

    fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory: {}", output_dir.display()))?;
    settings.save_snapshot(&output_dir.join("config_snapshot.yaml"))?;

    info!(
        input = %input_path.display(),
        output = %output_dir.display(),
        max_item_count = settings.batching.max_item_count,
        max_byte_size = settings.batching.max_byte_size,
        max_buffered_items = settings.batching.max_buffered_items,
        max_buffered_batches = settings.batching.max_buffered_batches,
        partition_field = ?settings.batching.partition_field,
        "Configuration ready"
    );

    let start_time = Utc::now();
    let metrics = Metrics::new();

    // Start a lightweight terminal progress bar that updates from Metrics
    let progress_running = Arc::new(AtomicBool::new(true));
    let progress_flag = Arc::clone(&progress_running);
    let progress_metrics = metrics.clone();
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("[{spinner}] {msg}")?);
    pb.enable_steady_tick(Duration::from_millis(200));
    let progress_handle = thread::spawn(move || {
        while progress_flag.load(Ordering::Relaxed) {
            let elapsed = progress_metrics.elapsed_secs();
            let items = progress_metrics.items_read();
            let ips = if elapsed > 0.0 {
                items as f64 / elapsed
            } else {
                0.0
            };
            pb.set_message(format!(
                "records: {} ({:.0}/s) | batches: {} | delivered: {} | rejected: {} | overflow flushes: {}",
                items,
                ips,
                progress_metrics.batches(),
                progress_metrics.items_delivered(),
                progress_metrics.items_rejected(),
                progress_metrics.overflow_flushes(),
            ));
            thread::sleep(Duration::from_millis(200));
        }
        pb.finish_and_clear();
    });

    let run_result = if input_path.is_dir() {
        info!("Swarm mode activated: processing directory");
        run_swarm_pipeline(&input_path, &output_dir, &settings, &metrics)
    } else {
        process_single_file(&input_path, &output_dir, &settings, &metrics)
    };

    progress_running.store(false, Ordering::Relaxed);
    let _ = progress_handle.join();

    let status = match &run_result {
        Ok(0) => RunStatus::Success,
        Ok(failed) => RunStatus::Partial {
            failed_items: *failed,
        },
        Err(e) => RunStatus::Error {
            message: format!("{:#}", e),
        },
    };

    let report = RunReport::generate(start_time, &metrics, status);
    let report_path = output_dir.join("report.yaml");
    if let Err(e) = report.save_yaml(&report_path) {
        error!("Failed to save report: {:#}", e);
    } else {
        info!(path = %report_path.display(), "Report saved");
    }

    print_summary(&metrics);

    run_result.map(|_| ())
}

/// Batches one NDJSON file into `output_dir`. Returns the number of records
/// that were not delivered.
fn process_single_file(
    input_path: &Path,
    output_dir: &Path,
    settings: &Settings,
    metrics: &Metrics,
) -> Result<u64> {
    let records = open_ndjson(
        input_path,
        settings.performance.buffer_size,
        settings.batching.partition_field.clone(),
        metrics,
    )
    .with_context(|| format!("Failed to open input: {}", input_path.display()))?;

    let mut submitter =
        StagingSubmitter::new(output_dir, settings.batching.max_byte_size, metrics.clone());
    let mut failure_log = FailureLog::new(output_dir.join("failures.ndjson"));

    let report = deliver_pipelined(
        records,
        &settings.batching,
        settings.performance.channel_capacity,
        &mut submitter,
        &mut |failure| failure_log.record(&failure),
        metrics,
    )?;

    let failures_path = failure_log.path().to_path_buf();
    let failed = failure_log
        .finish()
        .with_context(|| format!("Failed to write {}", failures_path.display()))?;
    if failed > 0 {
        warn!(
            input = %input_path.display(),
            failed,
            path = %failures_path.display(),
            "Some records were not delivered"
        );
    }

    if let Some(reason) = report.aborted {
        return Err(anyhow!(
            "Delivery aborted for {} (unread records remain): {}",
            input_path.display(),
            reason
        ));
    }

    Ok(failed)
}

/// Derive the per-file staging directory from an input path.
/// Handles both .ndjson and .ndjson.gz extensions.
fn derive_output_dir(input_path: &Path, output_dir: &Path) -> Result<PathBuf> {
    let file_name = input_path
        .file_name()
        .ok_or_else(|| anyhow!("Input path has no filename: {}", input_path.display()))?
        .to_string_lossy();

    let stem = file_name.strip_suffix(".gz").unwrap_or(&file_name);
    let stem = stem.strip_suffix(".ndjson").unwrap_or(stem);

    Ok(output_dir.join(stem))
}

/// Process every NDJSON file of a directory in parallel, one assembler per file.
fn run_swarm_pipeline(
    input_dir: &Path,
    output_dir: &Path,
    settings: &Settings,
    metrics: &Metrics,
) -> Result<u64> {
    let pattern_plain = input_dir.join("*.ndjson").to_string_lossy().to_string();
    let pattern_gz = input_dir.join("*.ndjson.gz").to_string_lossy().to_string();

    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in [&pattern_plain, &pattern_gz] {
        for entry in glob(pattern)? {
            match entry {
                Ok(path) => files.push(path),
                Err(e) => warn!("Failed to read glob entry: {}", e),
            }
        }
    }

    if files.is_empty() {
        return Err(anyhow!(
            "No NDJSON files found in directory: {}",
            input_dir.display()
        ));
    }

    info!(files = files.len(), "Swarm mode: found files to process");

    let failed_files = AtomicUsize::new(0);
    let failed_items = AtomicU64::new(0);

    files.par_iter().for_each(|input_path| {
        let file_output = match derive_output_dir(input_path, output_dir) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to derive output path for {}: {}", input_path.display(), e);
                failed_files.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        info!(
            input = %input_path.display(),
            output = %file_output.display(),
            "Processing"
        );

        // Per-file counters, folded into the run totals when the file is done.
        let file_metrics = Metrics::new();
        let outcome = fs::create_dir_all(&file_output)
            .with_context(|| format!("Failed to create {}", file_output.display()))
            .and_then(|_| process_single_file(input_path, &file_output, settings, &file_metrics));

        let counts = file_metrics.snapshot();
        counts.merge_into(metrics);
        info!(
            input = %input_path.display(),
            records = counts.items_read,
            batches = counts.batches_emitted,
            delivered = counts.items_delivered,
            "File finished"
        );

        match outcome {
            Ok(failed) => {
                failed_items.fetch_add(failed, Ordering::Relaxed);
            }
            Err(e) => {
                error!("Failed to process {}: {:#}", input_path.display(), e);
                failed_files.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let failures = failed_files.load(Ordering::Relaxed);
    if failures > 0 {
        Err(anyhow!(
            "Swarm completed with {} file(s) failed out of {}",
            failures,
            files.len()
        ))
    } else {
        info!(files = files.len(), "Swarm completed successfully");
        Ok(failed_items.load(Ordering::Relaxed))
    }
}

fn print_summary(metrics: &Metrics) {
    let elapsed = metrics.elapsed_secs();
    let items = metrics.items_read();
    let items_per_sec = if elapsed > 0.0 {
        items as f64 / elapsed
    } else {
        0.0
    };
    let mb_read = metrics.bytes_read() as f64 / (1024.0 * 1024.0);
    let mb_written = metrics.bytes_written() as f64 / (1024.0 * 1024.0);

    info!("=== Batching Summary ===");
    info!("Records read:      {}", items);
    info!("Records batched:   {}", metrics.items_batched());
    info!("Unmeasurable:      {}", metrics.items_unmeasurable());
    info!("Batches emitted:   {}", metrics.batches());
    info!("Overflow flushes:  {}", metrics.overflow_flushes());
    info!("Oversized batches: {}", metrics.oversized_batches());
    info!("Delivered:         {}", metrics.items_delivered());
    info!("Rejected:          {}", metrics.items_rejected());
    info!("Aborted:           {}", metrics.items_aborted());
    info!("Time elapsed:      {:.2}s", elapsed);
    info!("Throughput:        {:.0} records/sec", items_per_sec);
    info!("Bytes read:        {:.2} MB", mb_read);
    info!("Bytes written:     {:.2} MB", mb_written);
}
