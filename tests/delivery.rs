mod common;

use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use bulk_batcher::config::BatchSettings;
use bulk_batcher::error::BatchError;
use bulk_batcher::metrics::Metrics;
use bulk_batcher::pipeline::{
    deliver, deliver_pipelined, Assembler, Batch, ItemFailure, SubmitOutcome,
};

use common::{record, unmeasurable, Record};

fn stream(count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let key = if i % 3 == 0 { Some("a") } else { Some("b") };
            record(i, key, 10)
        })
        .collect()
}

fn failed_ids(failures: &[ItemFailure<Record>]) -> Vec<usize> {
    let mut ids: Vec<usize> = failures.iter().map(|f| f.item.id).collect();
    ids.sort_unstable();
    ids
}

fn count_aborted(failures: &[ItemFailure<Record>]) -> usize {
    failures
        .iter()
        .filter(|f| matches!(f.error, BatchError::Aborted(_)))
        .count()
}

fn reject_all(_batch: &Batch<Record>) -> SubmitOutcome {
    SubmitOutcome::Rejected {
        reason: "503 service unavailable".to_string(),
    }
}

#[test]
fn accepted_batches_deliver_everything() {
    let metrics = Metrics::new();
    let assembler = Assembler::new(stream(50), &BatchSettings::with_limits(4, 1_000)).unwrap();
    let mut seen = Vec::new();
    let mut submit = |batch: &Batch<Record>| {
        seen.extend(batch.items().iter().map(|r| r.id));
        SubmitOutcome::Accepted
    };
    let mut failures = Vec::new();

    let report = deliver(assembler, &mut submit, &mut |f| failures.push(f), &metrics);

    assert!(report.is_clean());
    assert!(failures.is_empty());
    assert_eq!(report.items_delivered, 50);
    assert_eq!(metrics.items_delivered(), 50);
    seen.sort_unstable();
    assert_eq!(seen, (0..50).collect::<Vec<_>>());
}

#[test]
fn partial_results_map_back_by_index() {
    let metrics = Metrics::new();
    let items = (0..6).map(|i| record(i, Some("t"), 10)).collect::<Vec<_>>();
    let assembler = Assembler::new(items, &BatchSettings::with_limits(3, 1_000)).unwrap();

    // Reject the middle record of every request.
    let mut submit = |_batch: &Batch<Record>| SubmitOutcome::Partial {
        errors: BTreeMap::from([(1, "invalid field".to_string())]),
    };
    let mut failures = Vec::new();
    let report = deliver(assembler, &mut submit, &mut |f| failures.push(f), &metrics);

    assert_eq!(report.batches_submitted, 2);
    assert_eq!(report.items_delivered, 4);
    assert_eq!(report.items_failed, 2);
    assert_eq!(failed_ids(&failures), vec![1, 4]);
    assert!(failures
        .iter()
        .all(|f| matches!(&f.error, BatchError::Rejected(msg) if msg == "invalid field")));
    assert!(report.aborted.is_none());
    assert_eq!(metrics.items_rejected(), 2);
}

#[test]
fn stray_indices_are_ignored() {
    let metrics = Metrics::new();
    let items = vec![record(0, None, 1), record(1, None, 1)];
    let assembler = Assembler::new(items, &BatchSettings::with_limits(5, 100)).unwrap();
    let mut submit = |_batch: &Batch<Record>| SubmitOutcome::Partial {
        errors: BTreeMap::from([(7, "no such row".to_string())]),
    };
    let mut failures = Vec::new();

    let report = deliver(assembler, &mut submit, &mut |f| failures.push(f), &metrics);
    assert!(report.is_clean());
    assert_eq!(report.items_delivered, 2);
}

#[test]
fn whole_batch_rejection_aborts_the_rest() {
    let metrics = Metrics::new();
    let mut source = (0..20)
        .map(|i| record(i, None, 10))
        .collect::<Vec<_>>()
        .into_iter();
    let assembler =
        Assembler::new(source.by_ref(), &BatchSettings::with_limits(5, 1_000)).unwrap();

    let mut calls = 0;
    let mut submit = |batch: &Batch<Record>| {
        calls += 1;
        if calls == 2 {
            reject_all(batch)
        } else {
            SubmitOutcome::Accepted
        }
    };
    let mut failures = Vec::new();
    let report = deliver(assembler, &mut submit, &mut |f| failures.push(f), &metrics);

    assert_eq!(calls, 2);
    assert_eq!(report.items_delivered, 5);
    assert_eq!(report.aborted.as_deref(), Some("503 service unavailable"));

    // Items 5..=9 were in the rejected batch; item 10 closed it and was
    // waiting for the next one. Nothing past it was read.
    assert_eq!(failed_ids(&failures), (5..=10).collect::<Vec<_>>());
    assert_eq!(count_aborted(&failures), 1);
    assert_eq!(report.items_failed, 6);
    assert_eq!(metrics.items_rejected(), 5);
    assert_eq!(metrics.items_aborted(), 1);

    let unread: Vec<usize> = source.map(|r| r.id).collect();
    assert_eq!(unread, (11..20).collect::<Vec<_>>());
}

#[test]
fn rejected_first_batch_stops_reading_the_source() {
    let metrics = Metrics::new();
    let pulled = Cell::new(0usize);
    let source = (0..2_000_000).map(|i| {
        pulled.set(pulled.get() + 1);
        record(i, None, 10)
    });
    let settings = BatchSettings {
        max_buffered_items: 10,
        ..BatchSettings::with_limits(5, 1_000)
    };
    let assembler = Assembler::new(source, &settings).unwrap();

    let mut failures = Vec::new();
    let report = deliver(assembler, &mut reject_all, &mut |f| failures.push(f), &metrics);

    assert_eq!(report.batches_submitted, 1);
    assert!(report.aborted.is_some());
    assert_eq!(pulled.get(), 6);
    assert_eq!(failures.len(), 6);
    assert_eq!(report.items_failed, 6);
}

#[test]
fn measurement_failures_reach_the_callback() {
    let metrics = Metrics::new();
    let items = vec![
        record(0, Some("t"), 10),
        unmeasurable(1, Some("t")),
        record(2, Some("t"), 10),
        unmeasurable(3, None),
    ];
    let assembler = Assembler::new(items, &BatchSettings::with_limits(10, 100)).unwrap();
    let mut submit = |_batch: &Batch<Record>| SubmitOutcome::Accepted;
    let mut failures = Vec::new();

    let report = deliver(assembler, &mut submit, &mut |f| failures.push(f), &metrics);

    assert_eq!(report.items_delivered, 2);
    assert_eq!(report.items_failed, 2);
    assert_eq!(failed_ids(&failures), vec![1, 3]);
    assert!(failures
        .iter()
        .all(|f| matches!(f.error, BatchError::Measurement(_))));
}

#[test]
fn pipelined_delivery_matches_sequential() {
    let metrics = Metrics::new();
    let mut items = stream(500);
    items.push(unmeasurable(500, Some("a")));
    let mut delivered = Vec::new();
    let mut submit = |batch: &Batch<Record>| {
        assert!(batch.item_count() <= 7);
        delivered.extend(batch.items().iter().map(|r| r.id));
        SubmitOutcome::Accepted
    };
    let mut failures = Vec::new();

    let report = deliver_pipelined(
        items,
        &BatchSettings::with_limits(7, 1_000),
        2,
        &mut submit,
        &mut |f| failures.push(f),
        &metrics,
    )
    .unwrap();

    assert_eq!(report.items_delivered, 500);
    assert_eq!(failed_ids(&failures), vec![500]);
    assert_eq!(metrics.batches() as usize, report.batches_submitted);
    delivered.sort_unstable();
    assert_eq!(delivered, (0..500).collect::<Vec<_>>());
}

#[test]
fn pipelined_rejection_loses_nothing_it_pulled() {
    let metrics = Metrics::new();
    let mut source = (0..300)
        .map(|i| record(i, None, 10))
        .collect::<Vec<_>>()
        .into_iter();

    let mut calls = 0;
    let mut submit = |_batch: &Batch<Record>| {
        calls += 1;
        if calls == 3 {
            SubmitOutcome::Rejected {
                reason: "quota exceeded".to_string(),
            }
        } else {
            SubmitOutcome::Accepted
        }
    };
    let mut failures = Vec::new();

    let report = deliver_pipelined(
        source.by_ref(),
        &BatchSettings::with_limits(10, 1_000),
        4,
        &mut submit,
        &mut |f| failures.push(f),
        &metrics,
    )
    .unwrap();

    assert_eq!(calls, 3);
    assert_eq!(report.items_delivered, 20);
    assert_eq!(report.aborted.as_deref(), Some("quota exceeded"));

    // The producer runs at most a few batches ahead of the submitter.
    assert!(failures.len() <= 100);
    assert_eq!(count_aborted(&failures) + 10, failures.len());
    assert_eq!(metrics.items_aborted() as usize, count_aborted(&failures));

    // Delivered, failed and unread together are exactly the input.
    let mut rest = failed_ids(&failures);
    let unread: Vec<usize> = source.map(|r| r.id).collect();
    assert!(!unread.is_empty());
    rest.extend(unread);
    rest.sort_unstable();
    assert_eq!(rest, (20..300).collect::<Vec<_>>());
}

#[test]
fn pipelined_rejected_first_batch_stops_reading_the_source() {
    let metrics = Metrics::new();
    let pulled = AtomicUsize::new(0);
    let source = (0..2_000_000).map(|i| {
        pulled.fetch_add(1, Ordering::Relaxed);
        record(i, None, 10)
    });
    let settings = BatchSettings {
        max_buffered_items: 10,
        ..BatchSettings::with_limits(5, 1_000)
    };

    let mut failures = Vec::new();
    let report = deliver_pipelined(
        source,
        &settings,
        2,
        &mut reject_all,
        &mut |f| failures.push(f),
        &metrics,
    )
    .unwrap();

    assert_eq!(report.batches_submitted, 1);
    assert_eq!(report.items_failed, failures.len());
    let pulled = pulled.load(Ordering::Relaxed);
    assert!(pulled < 100, "pulled {pulled} items after the first rejection");
    assert_eq!(failures.len(), pulled);
}

#[test]
fn pipelined_rejects_invalid_settings() {
    let metrics = Metrics::new();
    let mut submit = |_batch: &Batch<Record>| SubmitOutcome::Accepted;
    let result = deliver_pipelined(
        Vec::<Record>::new(),
        &BatchSettings::with_limits(10, 0),
        1,
        &mut submit,
        &mut |_failure| {},
        &metrics,
    );
    assert!(matches!(result, Err(BatchError::InvalidConfig(_))));
}
