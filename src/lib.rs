//! Bounded, multi-partition batch assembly for bulk ingestion APIs.
//!
//! Records are pulled lazily from a source, grouped per partition key into
//! batches that respect a per-request item count and byte size, and handed to
//! the caller one completed batch at a time.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod report;
pub mod sink;
pub mod source;
