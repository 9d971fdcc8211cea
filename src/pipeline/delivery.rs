//! Submission loop around the assembler.
//!
//! The remote call itself lives behind [`BatchSubmitter`]; this module only
//! interprets its outcome and correlates per-item results back to the items
//! of the batch, by index.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{bounded, Sender};
use tracing::{debug, info, warn};

use crate::config::BatchSettings;
use crate::error::{BatchError, Result};
use crate::metrics::Metrics;
use crate::pipeline::assembler::Assembler;
use crate::pipeline::batch::Batch;
use crate::pipeline::item::{Item, ItemFailure};

/// What the remote API made of one bulk request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Every item was ingested.
    Accepted,
    /// The request failed as a whole (e.g. a 5xx). Nothing after it is sent.
    Rejected { reason: String },
    /// Some items failed; keys index into [`Batch::items`].
    Partial { errors: BTreeMap<usize, String> },
}

/// Executes one batch against the remote API.
pub trait BatchSubmitter<T> {
    fn submit(&mut self, batch: &Batch<T>) -> SubmitOutcome;
}

impl<T, F> BatchSubmitter<T> for F
where
    F: FnMut(&Batch<T>) -> SubmitOutcome,
{
    fn submit(&mut self, batch: &Batch<T>) -> SubmitOutcome {
        self(batch)
    }
}

/// Counts from pushing a source through a submitter.
///
/// Failed items are not kept here; they go to the caller's failure callback
/// as they happen.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub batches_submitted: usize,
    pub items_delivered: usize,
    /// Unmeasurable, rejected and aborted items handed to the callback.
    pub items_failed: usize,
    /// Reason of the whole-batch rejection that stopped delivery, if any.
    pub aborted: Option<String>,
}

impl DeliveryReport {
    /// True when every input item was delivered.
    pub fn is_clean(&self) -> bool {
        self.items_failed == 0 && self.aborted.is_none()
    }

    fn fail<T, F>(&mut self, failure: ItemFailure<T>, on_failure: &mut F)
    where
        F: FnMut(ItemFailure<T>),
    {
        self.items_failed += 1;
        on_failure(failure);
    }

    fn fail_all<T, F>(&mut self, failures: Vec<ItemFailure<T>>, on_failure: &mut F)
    where
        F: FnMut(ItemFailure<T>),
    {
        for failure in failures {
            self.fail(failure, on_failure);
        }
    }

    /// Applies a submit outcome to the batch's items. A whole-batch rejection
    /// sets `aborted`.
    fn settle<T, F>(
        &mut self,
        batch: Batch<T>,
        outcome: SubmitOutcome,
        on_failure: &mut F,
        metrics: &Metrics,
    ) where
        F: FnMut(ItemFailure<T>),
    {
        self.batches_submitted += 1;
        let partition = batch.partition_key().to_string();
        let count = batch.item_count();

        match outcome {
            SubmitOutcome::Accepted => {
                self.items_delivered += count;
                metrics.add_items_delivered(count as u64);
            }
            SubmitOutcome::Rejected { reason } => {
                warn!(
                    partition = %partition,
                    items = count,
                    %reason,
                    "batch rejected, aborting delivery"
                );
                metrics.add_items_rejected(count as u64);
                for item in batch.into_items() {
                    self.fail(
                        ItemFailure::new(item, BatchError::Rejected(reason.clone())),
                        on_failure,
                    );
                }
                self.aborted = Some(reason);
            }
            SubmitOutcome::Partial { mut errors } => {
                let mut rejected = 0u64;
                for (index, item) in batch.into_items().into_iter().enumerate() {
                    match errors.remove(&index) {
                        Some(message) => {
                            rejected += 1;
                            self.fail(
                                ItemFailure::new(item, BatchError::Rejected(message)),
                                on_failure,
                            );
                        }
                        None => self.items_delivered += 1,
                    }
                }
                if !errors.is_empty() {
                    let stray: Vec<usize> = errors.keys().copied().collect();
                    warn!(
                        partition = %partition,
                        items = count,
                        indices = ?stray,
                        "submitter reported errors for indices outside the batch"
                    );
                }
                debug!(partition = %partition, items = count, rejected, "batch partially accepted");
                metrics.add_items_rejected(rejected);
                metrics.add_items_delivered(count as u64 - rejected);
            }
        }
    }

    /// Fails items that were pulled but will never be submitted.
    fn fail_unsent<T, F>(
        &mut self,
        items: impl IntoIterator<Item = T>,
        on_failure: &mut F,
        metrics: &Metrics,
    ) where
        F: FnMut(ItemFailure<T>),
    {
        let reason = self.aborted.clone().unwrap_or_default();
        let mut count = 0u64;
        for item in items {
            count += 1;
            self.fail(
                ItemFailure::new(item, BatchError::Aborted(reason.clone())),
                on_failure,
            );
        }
        metrics.add_items_aborted(count);
    }
}

/// Submits every batch the assembler produces, on the calling thread.
///
/// Every failed item is passed to `on_failure` as soon as it is known. A
/// whole-batch rejection stops the loop: the items the assembler already
/// pulled are failed as aborted, without further submit calls, and the rest
/// of the source is left unread. Pass `source.by_ref()` to the assembler to
/// keep access to it.
pub fn deliver<I, S, F>(
    mut assembler: Assembler<I>,
    submitter: &mut S,
    on_failure: &mut F,
    metrics: &Metrics,
) -> DeliveryReport
where
    I: Iterator,
    I::Item: Item,
    S: BatchSubmitter<I::Item>,
    F: FnMut(ItemFailure<I::Item>),
{
    let mut report = DeliveryReport::default();

    while let Some(batch) = assembler.next() {
        report.fail_all(assembler.take_failures(), on_failure);

        let outcome = submitter.submit(&batch);
        report.settle(batch, outcome, on_failure, metrics);
        if report.aborted.is_some() {
            report.fail_all(assembler.take_failures(), on_failure);
            let mut remaining = assembler.into_remaining();
            let pulled = remaining.buffered_len();
            report.fail_unsent(remaining.by_ref().take(pulled), on_failure, metrics);
            return report;
        }
    }

    report.fail_all(assembler.take_failures(), on_failure);
    info!(
        batches = report.batches_submitted,
        delivered = report.items_delivered,
        failed = report.items_failed,
        "delivery finished"
    );
    report
}

/// What the producer thread sends to the submitting side.
enum Feed<T> {
    Batch(Batch<T>),
    Failed(ItemFailure<T>),
    /// Pulled from the source but never submitted because delivery aborted.
    Unsent(T),
}

fn feed<I>(mut assembler: Assembler<I>, sender: Sender<Feed<I::Item>>, abort: &AtomicBool)
where
    I: Iterator,
    I::Item: Item,
{
    // A send only fails once the receiver is gone, which happens when the
    // submitting side panicked. That panic is what the caller sees.
    while !abort.load(Ordering::Acquire) {
        let next = assembler.next();
        for failure in assembler.take_failures() {
            if sender.send(Feed::Failed(failure)).is_err() {
                return;
            }
        }
        let Some(batch) = next else {
            return;
        };
        if sender.send(Feed::Batch(batch)).is_err() {
            return;
        }
    }

    let mut remaining = assembler.into_remaining();
    let pulled = remaining.buffered_len();
    for item in remaining.by_ref().take(pulled) {
        if sender.send(Feed::Unsent(item)).is_err() {
            return;
        }
    }
}

/// Same contract as [`deliver`], with assembly running on its own thread.
///
/// Batches and failures cross a bounded channel of `channel_capacity` slots,
/// so the assembler never runs more than that far ahead of the submitter.
/// `on_failure` runs on the calling thread.
pub fn deliver_pipelined<S, I, B, F>(
    source: S,
    settings: &BatchSettings,
    channel_capacity: usize,
    submitter: &mut B,
    on_failure: &mut F,
    metrics: &Metrics,
) -> Result<DeliveryReport>
where
    S: IntoIterator<IntoIter = I>,
    I: Iterator + Send,
    I::Item: Item + Send,
    B: BatchSubmitter<I::Item>,
    F: FnMut(ItemFailure<I::Item>),
{
    let assembler = Assembler::new(source, settings)?.with_metrics(metrics.clone());
    let (tx, rx) = bounded(channel_capacity);
    let abort = AtomicBool::new(false);

    let report = thread::scope(|scope| {
        let abort_flag = &abort;
        let producer = scope.spawn(move || feed(assembler, tx, abort_flag));

        let mut report = DeliveryReport::default();

        // Ends once the producer returns and drops its sender.
        for message in rx.iter() {
            match message {
                Feed::Failed(failure) => report.fail(failure, on_failure),
                Feed::Unsent(item) => report.fail_unsent([item], on_failure, metrics),
                // Already queued when the abort was raised.
                Feed::Batch(batch) if report.aborted.is_some() => {
                    report.fail_unsent(batch.into_items(), on_failure, metrics)
                }
                Feed::Batch(batch) => {
                    let outcome = submitter.submit(&batch);
                    report.settle(batch, outcome, on_failure, metrics);
                    if report.aborted.is_some() {
                        abort.store(true, Ordering::Release);
                    }
                }
            }
        }

        if let Err(panic) = producer.join() {
            std::panic::resume_unwind(panic);
        }
        report
    });

    info!(
        batches = report.batches_submitted,
        delivered = report.items_delivered,
        failed = report.items_failed,
        "pipelined delivery finished"
    );
    Ok(report)
}
