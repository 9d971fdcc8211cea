use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{BatchError, Result};
use crate::metrics::Metrics;
use crate::pipeline::batch::Batch;
use crate::pipeline::delivery::{BatchSubmitter, SubmitOutcome};
use crate::pipeline::item::ItemFailure;
use crate::source::ndjson::NdjsonRecord;

const DEFAULT_PARTITION_DIR: &str = "_default";

/// Stages every batch as one NDJSON file, one directory per partition.
///
/// The per-request byte limit is enforced here the way the remote API would:
/// a record larger than the limit is refused individually, so an oversized
/// single-item batch surfaces as a per-item error.
pub struct StagingSubmitter {
    root: PathBuf,
    max_byte_size: u64,
    next_sequence: u64,
    metrics: Metrics,
}

impl StagingSubmitter {
    pub fn new(root: impl Into<PathBuf>, max_byte_size: u64, metrics: Metrics) -> Self {
        Self {
            root: root.into(),
            max_byte_size,
            next_sequence: 0,
            metrics,
        }
    }

    /// Directory holding the batches of `partition_key`.
    pub fn partition_dir(&self, partition_key: &str) -> PathBuf {
        self.root.join(partition_dir_name(partition_key))
    }

    fn write_batch(
        &mut self,
        batch: &Batch<NdjsonRecord>,
        skip: &BTreeMap<usize, String>,
    ) -> Result<u64> {
        let dir = self.partition_dir(batch.partition_key());
        fs::create_dir_all(&dir)?;

        self.next_sequence += 1;
        let path = dir.join(format!("batch_{:06}.ndjson", self.next_sequence));
        let mut writer = BufWriter::new(File::create(&path)?);

        let mut written = 0u64;
        for (index, record) in batch.items().iter().enumerate() {
            if skip.contains_key(&index) {
                continue;
            }
            writer.write_all(record.raw.as_bytes())?;
            writer.write_all(b"\n")?;
            written += record.raw.len() as u64 + 1;
        }
        writer.flush()?;

        Ok(written)
    }
}

impl BatchSubmitter<NdjsonRecord> for StagingSubmitter {
    fn submit(&mut self, batch: &Batch<NdjsonRecord>) -> SubmitOutcome {
        let errors: BTreeMap<usize, String> = batch
            .items()
            .iter()
            .enumerate()
            .filter(|(_, record)| record.raw.len() as u64 > self.max_byte_size)
            .map(|(index, record)| {
                (
                    index,
                    format!(
                        "record of {} bytes exceeds request limit of {} bytes",
                        record.raw.len(),
                        self.max_byte_size
                    ),
                )
            })
            .collect();

        if errors.len() == batch.item_count() {
            return SubmitOutcome::Partial { errors };
        }

        match self.write_batch(batch, &errors) {
            Ok(bytes) => {
                self.metrics.add_bytes_written(bytes);
                if errors.is_empty() {
                    SubmitOutcome::Accepted
                } else {
                    SubmitOutcome::Partial { errors }
                }
            }
            Err(e) => SubmitOutcome::Rejected {
                reason: format!("staging write failed: {e}"),
            },
        }
    }
}

fn partition_dir_name(partition_key: &str) -> String {
    if partition_key.is_empty() {
        return DEFAULT_PARTITION_DIR.to_string();
    }
    let cleaned: String = partition_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        return DEFAULT_PARTITION_DIR.to_string();
    }
    cleaned
}

#[derive(Serialize)]
struct FailureLine<'a> {
    line: u64,
    partition: Option<&'a str>,
    error: String,
}

/// Appends one JSON line per failed record (input line number, partition and
/// reason) as failures are reported.
///
/// The file is created on the first failure, so a clean run leaves none
/// behind. A write error stops further writes and is returned by
/// [`FailureLog::finish`]; failures keep being counted.
pub struct FailureLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    recorded: u64,
    error: Option<BatchError>,
}

impl FailureLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: None,
            recorded: 0,
            error: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&mut self, failure: &ItemFailure<NdjsonRecord>) {
        self.recorded += 1;
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.write_line(failure) {
            self.error = Some(e);
        }
    }

    fn write_line(&mut self, failure: &ItemFailure<NdjsonRecord>) -> Result<()> {
        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                BufWriter::new(File::create(&self.path)?)
            }
        };
        let writer = self.writer.insert(writer);

        let line = FailureLine {
            line: failure.item.line_number,
            partition: failure.item.partition.as_deref(),
            error: failure.error.to_string(),
        };
        serde_json::to_writer(&mut *writer, &line)?;
        writer.write_all(b"\n")?;
        Ok(())
    }

    /// Flushes the file and returns how many failures were recorded.
    pub fn finish(self) -> Result<u64> {
        if let Some(e) = self.error {
            return Err(e);
        }
        if let Some(mut writer) = self.writer {
            writer.flush()?;
        }
        Ok(self.recorded)
    }
}
