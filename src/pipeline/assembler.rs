use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::BatchSettings;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pipeline::batch::{Batch, BatchLimits};
use crate::pipeline::item::{Item, ItemFailure};

/// A measured item waiting to be routed.
struct PendingItem<T> {
    item: T,
    partition_key: String,
    byte_size: u64,
}

/// An open batch plus its creation order, used to pick which batch to flush.
struct OpenBatch<T> {
    sequence: u64,
    batch: Batch<T>,
}

/// Groups a stream of items into per-partition batches.
///
/// The assembler is a single-pass pull iterator: every call to
/// [`Assembler::next_batch`] (or [`Iterator::next`]) pulls just enough items
/// from the source to produce one completed batch. At most one open batch
/// exists per partition key, and at most one item (the carry-over) is held
/// outside a batch.
///
/// Memory stays bounded by `max_buffered_items` and `max_buffered_batches`:
/// once either is exceeded, the oldest open batch is yielded before any
/// further item is pulled, full or not.
pub struct Assembler<I>
where
    I: Iterator,
    I::Item: Item,
{
    source: I,
    source_exhausted: bool,
    limits: BatchLimits,
    default_partition_key: String,
    max_buffered_items: usize,
    max_buffered_batches: usize,
    open_batches: HashMap<String, OpenBatch<I::Item>>,
    /// Single slot. Holds an item whose batch closed under it, or one
    /// measured ahead of time by `has_next`.
    carry_over: Option<PendingItem<I::Item>>,
    buffered_items: usize,
    next_sequence: u64,
    failures: Vec<ItemFailure<I::Item>>,
    metrics: Option<Metrics>,
}

impl<I> Assembler<I>
where
    I: Iterator,
    I::Item: Item,
{
    /// Creates an assembler over `source`. Settings are validated here, not on
    /// first use.
    pub fn new<S>(source: S, settings: &BatchSettings) -> Result<Self>
    where
        S: IntoIterator<IntoIter = I>,
    {
        settings.validate()?;

        Ok(Self {
            source: source.into_iter(),
            source_exhausted: false,
            limits: BatchLimits {
                max_item_count: settings.max_item_count,
                max_byte_size: settings.max_byte_size,
            },
            default_partition_key: settings.default_partition_key.clone(),
            max_buffered_items: settings.max_buffered_items,
            max_buffered_batches: settings.max_buffered_batches,
            open_batches: HashMap::new(),
            carry_over: None,
            buffered_items: 0,
            next_sequence: 0,
            failures: Vec::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Whether another batch can be produced.
    ///
    /// When nothing is buffered this pulls ahead until it finds one measurable
    /// item (recording failures for unmeasurable ones on the way), so a `true`
    /// answer always means [`Assembler::next_batch`] will succeed. As a
    /// consequence, a source whose remaining items are all unmeasurable
    /// reports `false` here even though it was not empty; those items end up
    /// in [`Assembler::take_failures`].
    pub fn has_next(&mut self) -> bool {
        if self.carry_over.is_some() || !self.open_batches.is_empty() {
            return true;
        }
        self.carry_over = self.pull();
        self.carry_over.is_some()
    }

    /// Produces the next completed batch.
    ///
    /// # Panics
    ///
    /// Panics when no batch is available. Check [`Assembler::has_next`]
    /// first, or drive the assembler as an [`Iterator`].
    pub fn next_batch(&mut self) -> Batch<I::Item> {
        match self.produce() {
            Some(batch) => batch,
            None => panic!("next_batch called on an exhausted assembler; check has_next first"),
        }
    }

    /// Drains the items that failed measurement since the last call.
    pub fn take_failures(&mut self) -> Vec<ItemFailure<I::Item>> {
        std::mem::take(&mut self.failures)
    }

    /// Items currently held in open batches.
    pub fn buffered_items(&self) -> usize {
        self.buffered_items
    }

    /// Number of open batches.
    pub fn buffered_batches(&self) -> usize {
        self.open_batches.len()
    }

    pub fn has_pending_carry_over(&self) -> bool {
        self.carry_over.is_some()
    }

    /// Gives back every item not yet yielded in a batch, lazily: the
    /// carry-over, the contents of open batches (oldest batch first), then
    /// the unread rest of the source. Items that already failed measurement
    /// are not included; take them with [`Assembler::take_failures`]
    /// beforehand.
    ///
    /// Only the items already pulled are held in memory. The source is read
    /// on demand, so stopping early leaves it unread.
    pub fn into_remaining(self) -> Remaining<I> {
        let mut buffered = Vec::with_capacity(self.buffered_items + 1);

        if let Some(pending) = self.carry_over {
            buffered.push(pending.item);
        }

        let mut open: Vec<OpenBatch<I::Item>> = self.open_batches.into_values().collect();
        open.sort_by_key(|o| o.sequence);
        for o in open {
            buffered.extend(o.batch.into_items());
        }

        Remaining {
            buffered: buffered.into_iter(),
            source: (!self.source_exhausted).then_some(self.source),
        }
    }

    fn produce(&mut self) -> Option<Batch<I::Item>> {
        loop {
            let pending = match self.carry_over.take() {
                Some(pending) => pending,
                None => {
                    if self.over_ceiling() {
                        debug!(
                            buffered_items = self.buffered_items,
                            buffered_batches = self.open_batches.len(),
                            "buffer ceiling exceeded, flushing oldest batch"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.inc_overflow_flushes();
                        }
                        return self.yield_oldest();
                    }
                    match self.pull() {
                        Some(pending) => pending,
                        // Source drained: flush what is left, one batch per call.
                        None => return self.yield_oldest(),
                    }
                }
            };

            if let Some(closed_key) = self.route(pending) {
                return self.yield_batch(&closed_key);
            }
        }
    }

    fn over_ceiling(&self) -> bool {
        self.buffered_items > self.max_buffered_items
            || self.open_batches.len() > self.max_buffered_batches
    }

    /// Pulls source items until one can be measured.
    fn pull(&mut self) -> Option<PendingItem<I::Item>> {
        while !self.source_exhausted {
            let Some(item) = self.source.next() else {
                self.source_exhausted = true;
                break;
            };
            if let Some(metrics) = &self.metrics {
                metrics.inc_items_read();
            }

            let partition_key = match item.partition_key() {
                Some(key) if !key.is_empty() => key.to_string(),
                _ => self.default_partition_key.clone(),
            };

            match item.byte_size() {
                Ok(byte_size) => {
                    return Some(PendingItem {
                        item,
                        partition_key,
                        byte_size,
                    })
                }
                Err(error) => {
                    warn!(partition = %partition_key, %error, "skipping unmeasurable item");
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_items_unmeasurable();
                    }
                    self.failures.push(ItemFailure::new(item, error));
                }
            }
        }
        None
    }

    /// Places `pending` into its partition's batch.
    ///
    /// Returns the key of a batch that closed because the item did not fit;
    /// the item then waits in the carry-over slot for a fresh batch.
    fn route(&mut self, pending: PendingItem<I::Item>) -> Option<String> {
        let limits = self.limits;
        let sequence = self.next_sequence;
        let open = self
            .open_batches
            .entry(pending.partition_key.clone())
            .or_insert_with(|| OpenBatch {
                sequence,
                batch: Batch::new(pending.partition_key.clone(), limits),
            });
        if open.sequence == sequence {
            self.next_sequence += 1;
        }
        let batch = &mut open.batch;

        let fits = batch.can_fit(pending.byte_size);
        if fits || batch.is_empty() {
            if !fits {
                debug!(
                    partition = %pending.partition_key,
                    item_bytes = pending.byte_size,
                    max_byte_size = limits.max_byte_size,
                    "item exceeds max_byte_size on its own, sending it alone"
                );
            }
            batch.append(pending.item, pending.byte_size);
            self.buffered_items += 1;
            if let Some(metrics) = &self.metrics {
                metrics.add_item_batched(pending.byte_size);
            }
            return None;
        }

        batch.close();
        debug!(
            partition = %pending.partition_key,
            items = batch.item_count(),
            bytes = batch.byte_size(),
            "batch full"
        );
        let key = pending.partition_key.clone();
        self.carry_over = Some(pending);
        Some(key)
    }

    fn yield_oldest(&mut self) -> Option<Batch<I::Item>> {
        let key = self
            .open_batches
            .iter()
            .min_by_key(|(_, open)| open.sequence)
            .map(|(key, _)| key.clone())?;
        self.yield_batch(&key)
    }

    fn yield_batch(&mut self, key: &str) -> Option<Batch<I::Item>> {
        let OpenBatch { mut batch, .. } = self.open_batches.remove(key)?;
        batch.close();
        self.buffered_items -= batch.item_count();

        if let Some(metrics) = &self.metrics {
            metrics.inc_batches();
            if batch.is_oversized() {
                metrics.inc_oversized_batches();
            }
        }

        Some(batch)
    }
}

/// Items an [`Assembler`] still owed when it was taken apart.
/// See [`Assembler::into_remaining`].
pub struct Remaining<I: Iterator> {
    buffered: std::vec::IntoIter<I::Item>,
    source: Option<I>,
}

impl<I: Iterator> Remaining<I> {
    /// How many of the remaining items were already pulled from the source.
    /// They come first.
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

impl<I: Iterator> Iterator for Remaining<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        if let Some(item) = self.buffered.next() {
            return Some(item);
        }
        self.source.as_mut()?.next()
    }
}

impl<I> Iterator for Assembler<I>
where
    I: Iterator,
    I::Item: Item,
{
    type Item = Batch<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        self.produce()
    }
}
