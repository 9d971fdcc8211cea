/// Per-request limits a batch is assembled against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_item_count: usize,
    pub max_byte_size: u64,
}

/// One partition's group of items, destined for a single bulk request.
///
/// Items keep their arrival order: index `i` of [`Batch::items`] is the
/// index the remote API reports per-item results against.
#[derive(Debug)]
pub struct Batch<T> {
    partition_key: String,
    items: Vec<T>,
    byte_size: u64,
    limits: BatchLimits,
    closed: bool,
}

impl<T> Batch<T> {
    pub fn new(partition_key: impl Into<String>, limits: BatchLimits) -> Self {
        Self {
            partition_key: partition_key.into(),
            items: Vec::new(),
            byte_size: 0,
            limits,
            closed: false,
        }
    }

    /// Whether one more item of `candidate_bytes` stays within both limits.
    pub fn can_fit(&self, candidate_bytes: u64) -> bool {
        if self.closed || self.items.len() >= self.limits.max_item_count {
            return false;
        }
        self.byte_size
            .checked_add(candidate_bytes)
            .is_some_and(|total| total <= self.limits.max_byte_size)
    }

    /// Appends without checking limits.
    ///
    /// Callers check [`Batch::can_fit`] first; the only exception is an empty
    /// batch taking a single oversized item.
    ///
    /// # Panics
    ///
    /// Panics if the batch is closed.
    pub fn append(&mut self, item: T, item_bytes: u64) {
        assert!(
            !self.closed,
            "append on closed batch for partition {:?}",
            self.partition_key
        );
        self.items.push(item);
        self.byte_size = self.byte_size.saturating_add(item_bytes);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// True for the single-item batch produced when one item alone exceeds
    /// `max_byte_size`.
    pub fn is_oversized(&self) -> bool {
        self.byte_size > self.limits.max_byte_size
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}
