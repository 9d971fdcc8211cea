//! Run report generation and YAML serialization.
//!
//! Captures environment, batching counters and delivery results of one run.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::path::Path;
use sysinfo::System;

use crate::metrics::Metrics;

/// Status of a run.
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "status")]
pub enum RunStatus {
    Success,
    /// Finished, but some records were not delivered.
    Partial { failed_items: u64 },
    Error { message: String },
}

/// Complete report for a single run.
#[derive(Serialize, Clone, Debug)]
pub struct RunReport {
    pub timestamp: DateTime<Utc>,
    pub duration_secs: f64,
    #[serde(flatten)]
    pub status: RunStatus,

    pub environment: EnvironmentInfo,
    pub batching: BatchingMetrics,
    pub delivery: DeliveryMetrics,
}

/// Environment information about the system.
#[derive(Serialize, Clone, Debug)]
pub struct EnvironmentInfo {
    pub os: String,
    pub os_version: String,
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub total_memory_gb: f64,
}

#[derive(Serialize, Clone, Debug)]
pub struct BatchingMetrics {
    pub items_read: u64,
    pub items_per_sec: f64,
    pub items_batched: u64,
    pub items_unmeasurable: u64,
    pub batches_emitted: u64,
    pub avg_items_per_batch: f64,
    pub overflow_flushes: u64,
    pub oversized_batches: u64,
    pub bytes_read: u64,
    pub bytes_batched: u64,
}

#[derive(Serialize, Clone, Debug)]
pub struct DeliveryMetrics {
    pub items_delivered: u64,
    pub items_rejected: u64,
    pub items_aborted: u64,
    pub bytes_written: u64,
}

impl EnvironmentInfo {
    /// Gather environment information from the system.
    pub fn gather() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let os = System::name().unwrap_or_else(|| "Unknown".to_string());
        let os_version = System::os_version().unwrap_or_else(|| "Unknown".to_string());

        let cpu_model = sys
            .cpus()
            .first()
            .map(|cpu| cpu.brand().to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let cpu_cores = sys.cpus().len();
        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);

        Self {
            os,
            os_version,
            cpu_model,
            cpu_cores,
            total_memory_gb,
        }
    }
}

impl RunReport {
    /// Generate a report from the run's metrics.
    pub fn generate(start_time: DateTime<Utc>, metrics: &Metrics, status: RunStatus) -> Self {
        let elapsed = metrics.elapsed_secs();
        let items_read = metrics.items_read();
        let batches = metrics.batches();

        let items_per_sec = if elapsed > 0.0 {
            items_read as f64 / elapsed
        } else {
            0.0
        };

        let avg_items_per_batch = if batches > 0 {
            metrics.items_batched() as f64 / batches as f64
        } else {
            0.0
        };

        Self {
            timestamp: start_time,
            duration_secs: elapsed,
            status,
            environment: EnvironmentInfo::gather(),
            batching: BatchingMetrics {
                items_read,
                items_per_sec,
                items_batched: metrics.items_batched(),
                items_unmeasurable: metrics.items_unmeasurable(),
                batches_emitted: batches,
                avg_items_per_batch,
                overflow_flushes: metrics.overflow_flushes(),
                oversized_batches: metrics.oversized_batches(),
                bytes_read: metrics.bytes_read(),
                bytes_batched: metrics.bytes_batched(),
            },
            delivery: DeliveryMetrics {
                items_delivered: metrics.items_delivered(),
                items_rejected: metrics.items_rejected(),
                items_aborted: metrics.items_aborted(),
                bytes_written: metrics.bytes_written(),
            },
        }
    }

    /// Save the report as YAML to the specified path.
    pub fn save_yaml(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self).context("Failed to serialize report to YAML")?;

        fs::write(path, yaml)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;

        Ok(())
    }
}
