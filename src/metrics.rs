use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Plain counters of one worker, e.g. one file in swarm mode.
/// Taken with [`Metrics::snapshot`], then merged into the run-wide
/// [`Metrics`] once the worker is done.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LocalMetrics {
    pub items_read: u64,
    pub items_batched: u64,
    pub items_unmeasurable: u64,
    pub batches_emitted: u64,
    pub bytes_batched: u64,
    pub overflow_flushes: u64,
    pub oversized_batches: u64,
    pub items_delivered: u64,
    pub items_rejected: u64,
    pub items_aborted: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge into a global Metrics instance (one atomic op per non-zero field)
    pub fn merge_into(&self, global: &Metrics) {
        let inner = &global.inner;
        add_nonzero(&inner.items_read, self.items_read);
        add_nonzero(&inner.items_batched, self.items_batched);
        add_nonzero(&inner.items_unmeasurable, self.items_unmeasurable);
        add_nonzero(&inner.batches_emitted, self.batches_emitted);
        add_nonzero(&inner.bytes_batched, self.bytes_batched);
        add_nonzero(&inner.overflow_flushes, self.overflow_flushes);
        add_nonzero(&inner.oversized_batches, self.oversized_batches);
        add_nonzero(&inner.items_delivered, self.items_delivered);
        add_nonzero(&inner.items_rejected, self.items_rejected);
        add_nonzero(&inner.items_aborted, self.items_aborted);
        add_nonzero(&inner.bytes_read, self.bytes_read);
        add_nonzero(&inner.bytes_written, self.bytes_written);
    }
}

fn add_nonzero(counter: &AtomicU64, value: u64) {
    if value > 0 {
        counter.fetch_add(value, Ordering::Relaxed);
    }
}

/// Counters shared by the reader, the assembler and the submitter.
///
/// Cloning is cheap: every clone points at the same atomics.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    start_time: Instant,
    items_read: AtomicU64,
    items_batched: AtomicU64,
    items_unmeasurable: AtomicU64,
    batches_emitted: AtomicU64,
    bytes_batched: AtomicU64,
    overflow_flushes: AtomicU64,
    oversized_batches: AtomicU64,
    items_delivered: AtomicU64,
    items_rejected: AtomicU64,
    items_aborted: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                start_time: Instant::now(),
                items_read: AtomicU64::new(0),
                items_batched: AtomicU64::new(0),
                items_unmeasurable: AtomicU64::new(0),
                batches_emitted: AtomicU64::new(0),
                bytes_batched: AtomicU64::new(0),
                overflow_flushes: AtomicU64::new(0),
                oversized_batches: AtomicU64::new(0),
                items_delivered: AtomicU64::new(0),
                items_rejected: AtomicU64::new(0),
                items_aborted: AtomicU64::new(0),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
            }),
        }
    }

    pub fn inc_items_read(&self) {
        self.inner.items_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_item_batched(&self, bytes: u64) {
        self.inner.items_batched.fetch_add(1, Ordering::Relaxed);
        self.inner.bytes_batched.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inc_items_unmeasurable(&self) {
        self.inner
            .items_unmeasurable
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_batches(&self) {
        self.inner.batches_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_overflow_flushes(&self) {
        self.inner.overflow_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_oversized_batches(&self) {
        self.inner.oversized_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_items_delivered(&self, count: u64) {
        self.inner
            .items_delivered
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_items_rejected(&self, count: u64) {
        self.inner.items_rejected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_items_aborted(&self, count: u64) {
        self.inner.items_aborted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_bytes_read(&self, bytes: u64) {
        self.inner.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.inner.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn items_read(&self) -> u64 {
        self.inner.items_read.load(Ordering::Relaxed)
    }

    pub fn items_batched(&self) -> u64 {
        self.inner.items_batched.load(Ordering::Relaxed)
    }

    pub fn items_unmeasurable(&self) -> u64 {
        self.inner.items_unmeasurable.load(Ordering::Relaxed)
    }

    pub fn batches(&self) -> u64 {
        self.inner.batches_emitted.load(Ordering::Relaxed)
    }

    pub fn bytes_batched(&self) -> u64 {
        self.inner.bytes_batched.load(Ordering::Relaxed)
    }

    pub fn overflow_flushes(&self) -> u64 {
        self.inner.overflow_flushes.load(Ordering::Relaxed)
    }

    pub fn oversized_batches(&self) -> u64 {
        self.inner.oversized_batches.load(Ordering::Relaxed)
    }

    pub fn items_delivered(&self) -> u64 {
        self.inner.items_delivered.load(Ordering::Relaxed)
    }

    pub fn items_rejected(&self) -> u64 {
        self.inner.items_rejected.load(Ordering::Relaxed)
    }

    pub fn items_aborted(&self) -> u64 {
        self.inner.items_aborted.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> u64 {
        self.inner.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes_written.load(Ordering::Relaxed)
    }

    /// Current values of every counter.
    pub fn snapshot(&self) -> LocalMetrics {
        LocalMetrics {
            items_read: self.items_read(),
            items_batched: self.items_batched(),
            items_unmeasurable: self.items_unmeasurable(),
            batches_emitted: self.batches(),
            bytes_batched: self.bytes_batched(),
            overflow_flushes: self.overflow_flushes(),
            oversized_batches: self.oversized_batches(),
            items_delivered: self.items_delivered(),
            items_rejected: self.items_rejected(),
            items_aborted: self.items_aborted(),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.inner.start_time.elapsed().as_secs_f64()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
