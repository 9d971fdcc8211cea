use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::error::{BatchError, Result};
use crate::metrics::Metrics;
use crate::pipeline::item::Item;

/// A wrapper reader that tracks bytes consumed for metrics.
pub struct TrackedReader<R> {
    inner: R,
    metrics: Metrics,
}

impl<R> TrackedReader<R> {
    pub fn new(inner: R, metrics: Metrics) -> Self {
        Self { inner, metrics }
    }
}

impl<R: Read> Read for TrackedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.inner.read(buf)?;
        self.metrics.add_bytes_read(bytes as u64);
        Ok(bytes)
    }
}

impl<R: BufRead> BufRead for TrackedReader<R> {
    fn fill_buf(&mut self) -> std::io::Result<&[u8]> {
        self.inner.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.metrics.add_bytes_read(amt as u64);
        self.inner.consume(amt);
    }
}

/// One line of an NDJSON input.
///
/// The line is kept verbatim: its length is what a bulk request pays for it.
/// A line that is not a JSON object still becomes a record, but measuring it
/// fails, so it is reported on its own without disturbing its neighbours.
#[derive(Debug, Clone, PartialEq)]
pub struct NdjsonRecord {
    pub line_number: u64,
    pub raw: String,
    pub partition: Option<String>,
    pub invalid: Option<String>,
}

impl NdjsonRecord {
    /// Parses `raw`, taking the partition from the string value of
    /// `partition_field` when present.
    pub fn parse(line_number: u64, raw: String, partition_field: Option<&str>) -> Self {
        let mut record = Self {
            line_number,
            raw,
            partition: None,
            invalid: None,
        };

        match serde_json::from_str::<Value>(&record.raw) {
            Ok(Value::Object(fields)) => {
                record.partition = partition_field
                    .and_then(|field| fields.get(field))
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            Ok(_) => record.invalid = Some("not a JSON object".to_string()),
            Err(e) => record.invalid = Some(e.to_string()),
        }

        record
    }
}

impl Item for NdjsonRecord {
    fn byte_size(&self) -> Result<u64> {
        match &self.invalid {
            Some(reason) => Err(BatchError::Measurement(format!(
                "line {}: {}",
                self.line_number, reason
            ))),
            None => Ok(self.raw.len() as u64),
        }
    }

    fn partition_key(&self) -> Option<&str> {
        self.partition.as_deref()
    }
}

/// Lazily turns a buffered reader into [`NdjsonRecord`]s, skipping blank lines.
///
/// A read error ends the stream; the failing line is still yielded as an
/// invalid record so the error is reported with the other item failures.
pub struct NdjsonRecords<R> {
    reader: R,
    partition_field: Option<String>,
    line_number: u64,
    buf: String,
    done: bool,
}

impl<R: BufRead> NdjsonRecords<R> {
    pub fn new(reader: R, partition_field: Option<String>) -> Self {
        Self {
            reader,
            partition_field,
            line_number: 0,
            buf: String::with_capacity(4096),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for NdjsonRecords<R> {
    type Item = NdjsonRecord;

    fn next(&mut self) -> Option<NdjsonRecord> {
        while !self.done {
            self.buf.clear();
            self.line_number += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    let line = self.buf.trim_end_matches(['\n', '\r']);
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(NdjsonRecord::parse(
                        self.line_number,
                        line.to_string(),
                        self.partition_field.as_deref(),
                    ));
                }
                Err(e) => {
                    self.done = true;
                    return Some(NdjsonRecord {
                        line_number: self.line_number,
                        raw: String::new(),
                        partition: None,
                        invalid: Some(format!("read error: {e}")),
                    });
                }
            }
        }
        None
    }
}

/// Opens an NDJSON file as a record stream.
/// Automatically detects .gz files and applies gzip decompression.
/// Tracks bytes read via the provided Metrics.
pub fn open_ndjson(
    path: &Path,
    buffer_size: usize,
    partition_field: Option<String>,
    metrics: &Metrics,
) -> Result<NdjsonRecords<TrackedReader<Box<dyn BufRead + Send>>>> {
    let file = File::open(path)?;

    let reader: Box<dyn BufRead + Send> = if path.extension().is_some_and(|ext| ext == "gz") {
        // Gzipped file: File -> GzDecoder -> BufReader
        let decoder = GzDecoder::new(file);
        Box::new(BufReader::with_capacity(buffer_size, decoder))
    } else {
        Box::new(BufReader::with_capacity(buffer_size, file))
    };

    let tracked = TrackedReader::new(reader, metrics.clone());
    Ok(NdjsonRecords::new(tracked, partition_field))
}
