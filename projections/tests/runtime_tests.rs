//! Integration tests for slicing and the aggregation runtime
//!
//! Operations are collected in an inline unit of work so tests can assert on
//! exactly what a fold queued.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use common::{
    BIN_DOCUMENT, Bin, BinAggregator, BinEvent, SKU_DOCUMENT, SkuTotal, SkuTotalsAggregator,
    bin_runtime, bin_storage, collecting_session, opened, picked, record, sku_runtime, stocked,
    upserted, upserts,
};
use foldline_core::aggregate::{ProjectionLifecycle, ShardExecutionMode};
use foldline_core::cancellation::CancellationSignal;
use foldline_core::error::{ProjectionError, StorageError};
use foldline_core::event::TenantId;
use foldline_core::operation::{ChangeSet, StorageOperation};
use foldline_core::session::{CommitListener, MessageOutbox};
use foldline_core::stream::{StreamActionType, StreamIdentity};
use foldline_projections::{
    AggregationRuntime, IdentityMap, MultiStreamSlicer, SingleStreamSlicer,
};
use foldline_testing::{InMemoryDocumentStorage, InMemoryDocumentStore, InMemoryOutbox};
use std::sync::Arc;

fn bin(id: &str, sku: &str, quantity: u32, version: u64) -> Bin {
    Bin {
        id: id.to_string(),
        sku: sku.to_string(),
        quantity,
        version,
        last_sequence: version,
    }
}

// ============================================================================
// ApplyChanges
// ============================================================================

/// Folding a new stream skips the load and upserts at the last version
#[tokio::test]
async fn test_new_stream_folds_without_loading() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, stocked("sku-1", 4)),
        record(3, "bin-1", 3, stocked("sku-1", 6)),
    ];
    let mut groups = runtime.slice(&events).unwrap();
    let mut slice = groups.remove(0).slices.remove(0);
    assert_eq!(slice.action(), StreamActionType::Start);

    runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(storage.load_count(), 0);
    assert_eq!(storage.load_many_count(), 0);

    let operations = unit.complete();
    assert_eq!(operations.len(), 1);
    match &operations[0] {
        StorageOperation::Upsert {
            document_type,
            id,
            revision,
            ignore_concurrency_violation,
            ..
        } => {
            assert_eq!(document_type, BIN_DOCUMENT);
            assert_eq!(id, "bin-1");
            assert_eq!(*revision, Some(3));
            assert!(*ignore_concurrency_violation);
        }
        other => panic!("expected an upsert, got {other:?}"),
    }
    let folded: Bin = upserted(&operations[0]);
    assert_eq!(folded, bin("bin-1", "sku-1", 10, 3));
    assert_eq!(slice.aggregate(), Some(&folded));
}

/// A fold whose last event satisfies the deletion predicate deletes an
/// existing document and queues no upsert
#[tokio::test]
async fn test_deletion_predicate_deletes_existing_document() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    store
        .insert(BIN_DOCUMENT, &TenantId::default(), &bin("bin-1", "sku-1", 3, 2))
        .unwrap();
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![record(3, "bin-1", 3, picked("sku-1", 3))];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);
    assert_eq!(slice.action(), StreamActionType::Append);

    runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(storage.load_count(), 1);
    let operations = unit.complete();
    assert_eq!(operations.len(), 1);
    assert!(operations[0].is_delete());
    assert_eq!(operations[0].document_id(), Some("bin-1"));
    assert!(upserts(&operations).is_empty());
    assert!(slice.aggregate().is_none());
}

/// Deleting something that never existed queues nothing
#[tokio::test]
async fn test_deleting_absent_document_is_a_no_op() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, stocked("sku-1", 2)),
        record(3, "bin-1", 3, picked("sku-1", 2)),
    ];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    assert!(unit.is_empty());
}

/// A delete-trigger event deletes without loading or folding
#[tokio::test]
async fn test_delete_trigger_short_circuits() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(7, "bin-1", 4, stocked("sku-1", 1)),
        record(8, "bin-1", 5, BinEvent::Retired),
    ];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(storage.load_count(), 0);
    let operations = unit.complete();
    assert_eq!(operations.len(), 1);
    assert!(operations[0].is_delete());
}

/// User failures are wrapped with the offending event
#[tokio::test]
async fn test_fold_failure_is_wrapped_with_event_identity() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, picked("sku-1", 5)),
    ];
    let event_id = events[1].id;
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    let err = runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    match err {
        ProjectionError::ApplyEvent {
            event_id: failed_id,
            sequence,
            stream,
            event_type,
            source,
        } => {
            assert_eq!(failed_id, event_id);
            assert_eq!(sequence, 2);
            assert_eq!(stream, StreamIdentity::key("bin-1"));
            assert_eq!(event_type, "BinPicked.v1");
            assert_eq!(source.to_string(), "bin holds 0 but 5 were picked");
        }
        other => panic!("expected ApplyEvent, got {other:?}"),
    }
    assert!(unit.is_empty());
}

/// Storage failures raised by fold code propagate unwrapped
#[tokio::test]
async fn test_storage_failure_in_fold_is_not_wrapped() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, _unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, BinEvent::Jammed),
    ];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    let err = runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProjectionError::Storage(StorageError::Transient(_))
    ));
}

/// An aggregate with no create result and no default document cannot start
/// from an arbitrary event
#[tokio::test]
async fn test_missing_creation_path_is_reported() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, _unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![record(1, "bin-1", 1, stocked("sku-1", 1))];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    let err = runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, ProjectionError::ApplyEvent { sequence: 1, .. }));
    assert!(err.to_string().contains("no default document"));
}

/// A cancelled signal makes the fold a no-op
#[tokio::test]
async fn test_cancelled_apply_queues_nothing() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);
    let cancel = CancellationSignal::new();
    cancel.cancel();

    let events = vec![record(1, "bin-1", 1, opened("sku-1"))];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);
    runtime
        .apply_changes(&session, &mut slice, ProjectionLifecycle::Async, &cancel)
        .await
        .unwrap();

    assert!(unit.is_empty());
}

// ============================================================================
// Side effects
// ============================================================================

/// Continuous async folds raise events with explicit versions and publish
/// messages through the unit of work's message batch
#[tokio::test]
async fn test_side_effects_in_continuous_mode() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let outbox = InMemoryOutbox::new();
    let (session, unit) = collecting_session(
        ShardExecutionMode::Continuous,
        Some(Arc::new(outbox.clone()) as Arc<dyn MessageOutbox>),
    );

    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, stocked("sku-1", 9)),
        record(3, "bin-1", 3, BinEvent::Counted),
    ];
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);

    runtime
        .apply_changes(
            &session,
            &mut slice,
            ProjectionLifecycle::Async,
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    let operations = unit.complete();
    assert_eq!(operations.len(), 2);
    assert!(operations[0].is_upsert());
    let StorageOperation::AppendEvents(append) = &operations[1] else {
        panic!("expected an append, got {:?}", operations[1]);
    };
    assert_eq!(append.stream, StreamIdentity::key("bin-1"));
    assert_eq!(append.expected_version, Some(4));
    assert_eq!(append.events.len(), 1);
    assert_eq!(append.events[0].version, Some(4));
    assert_eq!(append.events[0].event.event_type, "BinCountConfirmed.v1");

    assert_eq!(outbox.batches_created(), 1);
    let batch = unit.created_message_batch().expect("message batch created");
    // Published only once the batch commits.
    assert!(outbox.published().is_empty());
    batch.after_commit(ChangeSet::new(&[])).await.unwrap();
    let published = outbox.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message_type, "bin.counted");
    assert_eq!(published[0].body["quantity"], 9);
}

/// Rebuilds and inline projections never raise side effects
#[tokio::test]
async fn test_no_side_effects_outside_continuous_async() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let outbox = InMemoryOutbox::new();
    let events = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, BinEvent::Counted),
    ];

    for (mode, lifecycle) in [
        (ShardExecutionMode::Rebuild, ProjectionLifecycle::Async),
        (ShardExecutionMode::Continuous, ProjectionLifecycle::Inline),
    ] {
        let (session, unit) = collecting_session(
            mode,
            Some(Arc::new(outbox.clone()) as Arc<dyn MessageOutbox>),
        );
        let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);
        runtime
            .apply_changes(&session, &mut slice, lifecycle, &CancellationSignal::new())
            .await
            .unwrap();

        let operations = unit.complete();
        assert_eq!(operations.len(), 1, "{mode:?} {lifecycle:?}");
        assert!(operations[0].is_upsert());
    }
    assert_eq!(outbox.batches_created(), 0);
}

/// Rebuilds still relax the revision check; inline writes keep it
#[tokio::test]
async fn test_revision_check_is_only_enforced_inline() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);
    let events = vec![record(1, "bin-1", 1, opened("sku-1"))];

    let (rebuild, rebuild_unit) = collecting_session(ShardExecutionMode::Rebuild, None);
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);
    runtime
        .apply_changes(&rebuild, &mut slice, ProjectionLifecycle::Async, &CancellationSignal::new())
        .await
        .unwrap();

    let (inline, inline_unit) = collecting_session(ShardExecutionMode::Continuous, None);
    let mut slice = runtime.slice(&events).unwrap().remove(0).slices.remove(0);
    runtime
        .apply_changes(&inline, &mut slice, ProjectionLifecycle::Inline, &CancellationSignal::new())
        .await
        .unwrap();

    let ignored = |operations: &[StorageOperation]| match &operations[0] {
        StorageOperation::Upsert {
            ignore_concurrency_violation,
            ..
        } => *ignore_concurrency_violation,
        other => panic!("expected an upsert, got {other:?}"),
    };
    assert!(ignored(&rebuild_unit.complete()));
    assert!(!ignored(&inline_unit.complete()));
}

// ============================================================================
// Process group and cache
// ============================================================================

/// Without a cache every pass reloads; with one, the second pass reuses the
/// folded aggregate
#[tokio::test]
async fn test_cache_limit_controls_reloads() {
    for (limit, expected_loads) in [(0, 2), (10, 1)] {
        let store = InMemoryDocumentStore::new();
        let storage = bin_storage(&store);
        store
            .insert(BIN_DOCUMENT, &TenantId::default(), &bin("bin-1", "sku-1", 1, 2))
            .unwrap();
        let runtime = bin_runtime(&storage, limit);
        let cancel = CancellationSignal::new();

        for (sequence, version) in [(3, 3), (4, 4)] {
            let (session, _unit) = collecting_session(ShardExecutionMode::Continuous, None);
            let events = vec![record(sequence, "bin-1", version, stocked("sku-1", 1))];
            let group = runtime.slice(&events).unwrap().remove(0);
            runtime.process_group(&session, group, &cancel).await.unwrap();
        }

        assert_eq!(storage.load_many_count(), expected_loads, "cache limit {limit}");
        assert_eq!(storage.load_count(), 0);
    }
}

/// Cached aggregates are the post-fold state of the previous pass
#[tokio::test]
async fn test_cached_aggregate_carries_previous_fold() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 10);
    let cancel = CancellationSignal::new();

    let first = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, stocked("sku-1", 5)),
    ];
    let (session, _unit) = collecting_session(ShardExecutionMode::Continuous, None);
    runtime
        .process_group(&session, runtime.slice(&first).unwrap().remove(0), &cancel)
        .await
        .unwrap();

    let second = vec![record(3, "bin-1", 3, picked("sku-1", 2))];
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);
    runtime
        .process_group(&session, runtime.slice(&second).unwrap().remove(0), &cancel)
        .await
        .unwrap();

    assert_eq!(storage.load_many_count(), 0);
    let folded: Bin = upserted(&unit.complete()[0]);
    assert_eq!(folded.quantity, 3);
    assert_eq!(folded.version, 3);
    assert_eq!(runtime.cache_for(&TenantId::default()).len(), 1);
}

/// One multi-get resolves every miss of a group; new streams are skipped
#[tokio::test]
async fn test_misses_are_resolved_with_one_multi_get() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    for id in ["bin-1", "bin-2"] {
        store
            .insert(BIN_DOCUMENT, &TenantId::default(), &bin(id, "sku-1", 1, 1))
            .unwrap();
    }
    let runtime = bin_runtime(&storage, 10);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(10, "bin-1", 2, stocked("sku-1", 1)),
        record(11, "bin-2", 2, stocked("sku-1", 1)),
        record(12, "bin-3", 1, opened("sku-1")),
        record(13, "bin-4", 2, stocked("sku-1", 1)),
    ];
    let group = runtime.slice(&events).unwrap().remove(0);
    let result = runtime
        .process_group(&session, group, &CancellationSignal::new())
        .await;

    // bin-4 was never opened, so it cannot be created.
    assert!(matches!(result, Err(ProjectionError::ApplyEvent { sequence: 13, .. })));
    assert_eq!(storage.load_many_count(), 1);
    assert_eq!(
        storage.loaded_ids(),
        vec!["bin-1".to_string(), "bin-2".to_string(), "bin-4".to_string()]
    );

    // Sibling slices still completed, in slice order.
    let ids: Vec<_> = unit
        .complete()
        .iter()
        .filter_map(|op| op.document_id().map(ToString::to_string))
        .collect();
    assert_eq!(ids, vec!["bin-1", "bin-2", "bin-3"]);

    // A failed group leaves nothing cached.
    assert!(runtime.cache_for(&TenantId::default()).is_empty());
}

/// Operations of a group are queued in slice order regardless of
/// parallelism
#[tokio::test]
async fn test_group_operations_follow_slice_order() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = AggregationRuntime::builder(
        BinAggregator,
        Arc::clone(&storage) as _,
        SingleStreamSlicer::new(),
    )
    .max_slice_parallelism(4)
    .build()
    .unwrap();
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events: Vec<_> = (1..=20)
        .map(|n| record(n, &format!("bin-{n:02}"), 1, opened("sku-1")))
        .collect();
    let group = runtime.slice(&events).unwrap().remove(0);
    let slices = runtime
        .process_group(&session, group, &CancellationSignal::new())
        .await
        .unwrap();

    let expected: Vec<String> = (1..=20).map(|n| format!("bin-{n:02}")).collect();
    let queued: Vec<String> = unit
        .complete()
        .iter()
        .filter_map(|op| op.document_id().map(ToString::to_string))
        .collect();
    assert_eq!(queued, expected);
    assert_eq!(slices.len(), 20);
}

/// Tenants are sliced into separate groups with separate caches
#[tokio::test]
async fn test_tenants_are_grouped_separately() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 10);

    let events = vec![
        Arc::new(
            foldline_core::event::EventRecord::new(
                1,
                StreamIdentity::key("bin-1"),
                1,
                opened("sku-1"),
            )
            .with_tenant(TenantId::new("north")),
        ),
        Arc::new(
            foldline_core::event::EventRecord::new(
                2,
                StreamIdentity::key("bin-1"),
                1,
                opened("sku-1"),
            )
            .with_tenant(TenantId::new("south")),
        ),
    ];
    let groups = runtime.slice(&events).unwrap();
    assert_eq!(groups.len(), 2);

    for group in groups {
        let tenant = group.tenant_id.clone();
        let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);
        runtime
            .process_group(&session, group, &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(unit.complete()[0].tenant_id(), Some(&tenant));
    }

    assert_eq!(runtime.cache_for(&TenantId::new("north")).len(), 1);
    assert_eq!(runtime.cache_for(&TenantId::new("south")).len(), 1);
    runtime.clear_caches();
    assert!(runtime.cache_for(&TenantId::new("north")).is_empty());
}

// ============================================================================
// Multi-stream
// ============================================================================

/// Events from several streams fold into one document per SKU in global
/// sequence order, with fan-out to every derived identity
#[tokio::test]
async fn test_multi_stream_projection_spans_streams() {
    let store = InMemoryDocumentStore::new();
    let runtime = sku_runtime(&store);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![
        record(1, "bin-1", 1, opened("sku-a")),
        record(2, "bin-2", 1, opened("sku-a")),
        record(3, "bin-1", 2, stocked("sku-a", 4)),
        record(4, "bin-3", 1, opened("sku-b")),
        record(5, "bin-2", 2, stocked("sku-a", 3)),
        record(
            6,
            "bin-2",
            3,
            BinEvent::Relabelled {
                from: "sku-a".to_string(),
                to: "sku-b".to_string(),
            },
        ),
        record(7, "bin-1", 3, BinEvent::Counted),
    ];
    let groups = runtime.slice(&events).unwrap();
    assert_eq!(groups.len(), 1);
    let slices = &groups[0].slices;
    assert_eq!(slices.len(), 2);
    assert_eq!(
        slices[0].events().iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![1, 2, 3, 5, 6]
    );
    assert_eq!(
        slices[1].events().iter().map(|e| e.sequence).collect::<Vec<_>>(),
        vec![4, 6]
    );

    let group = groups.into_iter().next().unwrap();
    runtime
        .process_group(&session, group, &CancellationSignal::new())
        .await
        .unwrap();

    let operations = unit.complete();
    let totals: Vec<SkuTotal> = operations.iter().map(upserted).collect();
    assert_eq!(totals[0].id, "sku-a");
    assert_eq!(totals[0].bins, 2);
    assert_eq!(totals[0].on_hand, 7);
    assert_eq!(totals[0].relabels, 1);
    assert_eq!(totals[1].id, "sku-b");
    assert_eq!(totals[1].sequences, vec![4, 6]);
    for operation in &operations {
        assert!(matches!(
            operation,
            StorageOperation::Upsert {
                revision: None,
                document_type,
                ..
            } if document_type == SKU_DOCUMENT
        ));
    }
}

/// Multi-stream identities are only known to the slicer
#[tokio::test]
async fn test_identity_from_event_is_single_stream_only() {
    let store = InMemoryDocumentStore::new();
    let event = record(1, "bin-1", 1, opened("sku-a"));

    let multi = sku_runtime(&store);
    let err = multi.identity_from_event(&event).unwrap_err();
    assert!(matches!(err, ProjectionError::Configuration(ref message)
        if message.contains("not supported for multi-stream")));

    let single = bin_runtime(&bin_storage(&store), 0);
    assert_eq!(single.identity_from_event(&event).unwrap(), "bin-1");
}

/// A handled event type without an identity function fails at setup
#[test]
fn test_unrouted_event_type_fails_at_build() {
    let store = InMemoryDocumentStore::new();
    let storage = Arc::new(InMemoryDocumentStorage::<SkuTotal>::new(SKU_DOCUMENT, store));
    let slicer = MultiStreamSlicer::<SkuTotal, BinEvent>::new()
        .identity("BinOpened.v1", |event| match &event.data {
            BinEvent::Opened { sku } => Some(sku.clone()),
            _ => None,
        });

    let result = AggregationRuntime::builder(SkuTotalsAggregator, storage as _, slicer).build();

    match result {
        Err(ProjectionError::Configuration(message)) => {
            assert!(message.contains("BinStocked.v1"), "{message}");
        }
        Err(other) => panic!("expected a configuration error, got {other:?}"),
        Ok(_) => panic!("runtime should not build"),
    }
}

/// Zero parallelism is rejected
#[test]
fn test_zero_parallelism_fails_at_build() {
    let store = InMemoryDocumentStore::new();
    let result = AggregationRuntime::builder(
        BinAggregator,
        bin_storage(&store) as _,
        SingleStreamSlicer::new(),
    )
    .max_slice_parallelism(0)
    .build();

    assert!(matches!(result, Err(ProjectionError::Configuration(_))));
}

// ============================================================================
// Inline and live
// ============================================================================

/// With the identity map enabled, repeated inline applications in one
/// session see each other's results without reloading
#[tokio::test]
async fn test_inline_identity_map_chains_applications() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = AggregationRuntime::builder(
        BinAggregator,
        Arc::clone(&storage) as _,
        SingleStreamSlicer::new(),
    )
    .use_identity_map_for_inline(true)
    .build()
    .unwrap();
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);
    let session = session.with_identity_map(Arc::new(IdentityMap::new()));
    let cancel = CancellationSignal::new();

    let first = vec![
        record(1, "bin-1", 1, opened("sku-1")),
        record(2, "bin-1", 2, stocked("sku-1", 5)),
    ];
    runtime.apply_inline(&session, &first, &cancel).await.unwrap();
    let second = vec![record(3, "bin-1", 3, stocked("sku-1", 2))];
    runtime.apply_inline(&session, &second, &cancel).await.unwrap();

    assert_eq!(storage.load_count(), 0);
    let operations = unit.complete();
    assert_eq!(operations.len(), 2);
    let latest: Bin = upserted(&operations[1]);
    assert_eq!(latest.quantity, 7);
    assert_eq!(latest.version, 3);
}

/// Without the identity map, inline application loads from storage
#[tokio::test]
async fn test_inline_without_identity_map_loads_from_storage() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    store
        .insert(BIN_DOCUMENT, &TenantId::default(), &bin("bin-1", "sku-1", 5, 2))
        .unwrap();
    let runtime = bin_runtime(&storage, 0);
    let (session, unit) = collecting_session(ShardExecutionMode::Continuous, None);

    let events = vec![record(3, "bin-1", 3, stocked("sku-1", 2))];
    runtime
        .apply_inline(&session, &events, &CancellationSignal::new())
        .await
        .unwrap();

    assert_eq!(storage.load_count(), 1);
    let folded: Bin = upserted(&unit.complete()[0]);
    assert_eq!(folded.quantity, 7);
}

/// Live aggregation folds without touching storage
#[test]
fn test_aggregate_live() {
    let store = InMemoryDocumentStore::new();
    let storage = bin_storage(&store);
    let runtime = bin_runtime(&storage, 0);

    let events = vec![
        record(4, "bin-9", 1, opened("sku-1")),
        record(9, "bin-9", 2, stocked("sku-1", 3)),
    ];
    let live = runtime
        .aggregate_live(&"bin-9".to_string(), &events)
        .unwrap()
        .unwrap();

    assert_eq!(live.id, "bin-9");
    assert_eq!(live.quantity, 3);
    assert_eq!(live.version, 2);
    assert_eq!(live.last_sequence, 9);
    assert!(runtime.aggregate_live(&"bin-9".to_string(), &[]).unwrap().is_none());
    assert_eq!(storage.load_count(), 0);
    assert!(store.is_empty());
}
