//! Shared fixtures for the projection integration suites.
//!
//! A small warehouse domain: bins are opened for a SKU, stocked, picked,
//! counted and retired. [`BinAggregator`] folds single bins;
//! [`SkuTotalsAggregator`] folds stock per SKU across every bin.

#![allow(dead_code)] // Each suite uses a different subset

use foldline_core::aggregate::{Aggregator, EventSlice, Fold, ShardExecutionMode};
use foldline_core::config::DaemonSettings;
use foldline_core::environment::Clock;
use foldline_core::error::{BoxError, StorageError};
use foldline_core::event::{Event, EventRecord, TenantId};
use foldline_core::operation::StorageOperation;
use foldline_core::session::{CommitListener, MessageOutbox, OutboundMessage, UnitOfWork};
use foldline_core::storage::AggregateDocument;
use foldline_core::stream::StreamIdentity;
use foldline_projections::{
    AggregationRuntime, InlineUnitOfWork, MultiStreamSlicer, ProjectionSession, ShardAgent,
    ShardCollaborators, SingleStreamSlicer,
};
use foldline_testing::mocks::{ManualClock, test_epoch};
use foldline_testing::{
    InMemoryDocumentStorage, InMemoryDocumentStore, InMemoryEventLog, InMemoryOutbox,
    InMemorySessionFactory,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const BIN_SHARD: &str = "Bin:All";
pub const BIN_DOCUMENT: &str = "bin";
pub const SKU_DOCUMENT: &str = "sku_total";

// ============================================================================
// Events
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BinEvent {
    Opened { sku: String },
    Stocked { sku: String, quantity: u32 },
    Picked { sku: String, quantity: u32 },
    Counted,
    CountConfirmed { quantity: u32 },
    Relabelled { from: String, to: String },
    Jammed,
    Retired,
}

impl Event for BinEvent {
    fn event_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "BinOpened.v1",
            Self::Stocked { .. } => "BinStocked.v1",
            Self::Picked { .. } => "BinPicked.v1",
            Self::Counted => "BinCounted.v1",
            Self::CountConfirmed { .. } => "BinCountConfirmed.v1",
            Self::Relabelled { .. } => "BinRelabelled.v1",
            Self::Jammed => "BinJammed.v1",
            Self::Retired => "BinRetired.v1",
        }
    }
}

pub fn opened(sku: &str) -> BinEvent {
    BinEvent::Opened {
        sku: sku.to_string(),
    }
}

pub fn stocked(sku: &str, quantity: u32) -> BinEvent {
    BinEvent::Stocked {
        sku: sku.to_string(),
        quantity,
    }
}

pub fn picked(sku: &str, quantity: u32) -> BinEvent {
    BinEvent::Picked {
        sku: sku.to_string(),
        quantity,
    }
}

/// A committed record for the default tenant.
pub fn record(sequence: u64, bin: &str, version: u64, data: BinEvent) -> Arc<EventRecord<BinEvent>> {
    Arc::new(EventRecord::new(sequence, StreamIdentity::key(bin), version, data))
}

// ============================================================================
// Single-stream projection: one document per bin
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Bin {
    pub id: String,
    pub sku: String,
    pub quantity: u32,
    pub version: u64,
    pub last_sequence: u64,
}

impl AggregateDocument for Bin {
    type Id = String;

    fn identity(&self) -> String {
        self.id.clone()
    }

    fn set_identity(&mut self, id: &String) {
        self.id.clone_from(id);
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[derive(Debug, thiserror::Error)]
#[error("bin holds {available} but {requested} were picked")]
pub struct OverPick {
    pub available: u32,
    pub requested: u32,
}

/// Folds one bin's stream.
///
/// - a pick that empties the bin deletes it (deletion predicate)
/// - `Retired` is a delete trigger
/// - `Counted` raises `CountConfirmed` back onto the bin's stream and
///   publishes a `bin.counted` message
/// - `Jammed` fails with a storage error
pub struct BinAggregator;

impl Aggregator for BinAggregator {
    type Document = Bin;
    type Event = BinEvent;

    fn event_types(&self) -> &[&'static str] {
        &[
            "BinOpened.v1",
            "BinStocked.v1",
            "BinPicked.v1",
            "BinCounted.v1",
            "BinJammed.v1",
            "BinRetired.v1",
        ]
    }

    fn delete_event_types(&self) -> &[&'static str] {
        &["BinRetired.v1"]
    }

    fn create(&self, event: &EventRecord<BinEvent>) -> Result<Option<Bin>, BoxError> {
        Ok(match &event.data {
            BinEvent::Opened { sku } => Some(Bin {
                sku: sku.clone(),
                ..Bin::default()
            }),
            _ => None,
        })
    }

    fn apply(&self, bin: &mut Bin, event: &EventRecord<BinEvent>) -> Result<Fold<Bin>, BoxError> {
        match &event.data {
            BinEvent::Opened { sku } => {
                return Ok(Fold::Replace(Bin {
                    sku: sku.clone(),
                    ..Bin::default()
                }));
            }
            BinEvent::Stocked { quantity, .. } => bin.quantity += quantity,
            BinEvent::Picked { quantity, .. } => {
                if *quantity > bin.quantity {
                    return Err(Box::new(OverPick {
                        available: bin.quantity,
                        requested: *quantity,
                    }));
                }
                bin.quantity -= quantity;
            }
            BinEvent::Jammed => {
                return Err(Box::new(StorageError::Transient(
                    "scanner connection reset".to_string(),
                )));
            }
            BinEvent::Counted
            | BinEvent::CountConfirmed { .. }
            | BinEvent::Relabelled { .. }
            | BinEvent::Retired => {}
        }
        Ok(Fold::Keep)
    }

    fn should_delete(&self, bin: &Bin, event: &EventRecord<BinEvent>) -> bool {
        matches!(event.data, BinEvent::Picked { .. }) && bin.quantity == 0
    }

    fn apply_metadata(&self, mut bin: Bin, last_event: &EventRecord<BinEvent>) -> Bin {
        bin.last_sequence = last_event.sequence;
        bin
    }

    fn raise_side_effects(&self, slice: &mut EventSlice<Bin, BinEvent>) -> Result<(), BoxError> {
        let Some(last) = slice.last_event() else {
            return Ok(());
        };
        if !matches!(last.data, BinEvent::Counted) {
            return Ok(());
        }
        let stream = last.stream.clone();
        let quantity = slice.aggregate().map_or(0, |bin| bin.quantity);
        let body = serde_json::json!({ "bin": slice.id(), "quantity": quantity });
        slice.raise_event(stream, &BinEvent::CountConfirmed { quantity })?;
        slice.publish_message(OutboundMessage::new("bin.counted", body));
        Ok(())
    }
}

// ============================================================================
// Multi-stream projection: stock per SKU across bins
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SkuTotal {
    pub id: String,
    pub bins: u32,
    pub on_hand: u32,
    pub relabels: u32,
    pub sequences: Vec<u64>,
}

impl AggregateDocument for SkuTotal {
    type Id = String;

    fn identity(&self) -> String {
        self.id.clone()
    }

    fn set_identity(&mut self, id: &String) {
        self.id.clone_from(id);
    }
}

pub struct SkuTotalsAggregator;

impl Aggregator for SkuTotalsAggregator {
    type Document = SkuTotal;
    type Event = BinEvent;

    fn event_types(&self) -> &[&'static str] {
        &[
            "BinOpened.v1",
            "BinStocked.v1",
            "BinPicked.v1",
            "BinRelabelled.v1",
        ]
    }

    fn default_document(&self) -> Option<SkuTotal> {
        Some(SkuTotal::default())
    }

    fn apply(
        &self,
        total: &mut SkuTotal,
        event: &EventRecord<BinEvent>,
    ) -> Result<Fold<SkuTotal>, BoxError> {
        total.sequences.push(event.sequence);
        match &event.data {
            BinEvent::Opened { .. } => total.bins += 1,
            BinEvent::Stocked { quantity, .. } => total.on_hand += quantity,
            BinEvent::Picked { quantity, .. } => {
                total.on_hand = total.on_hand.saturating_sub(*quantity);
            }
            BinEvent::Relabelled { .. } => total.relabels += 1,
            _ => {}
        }
        Ok(Fold::Keep)
    }
}

/// Routes every handled event type to its SKU; relabels fan out to both.
pub fn sku_slicer() -> MultiStreamSlicer<SkuTotal, BinEvent> {
    fn sku_of(event: &EventRecord<BinEvent>) -> Option<String> {
        match &event.data {
            BinEvent::Opened { sku }
            | BinEvent::Stocked { sku, .. }
            | BinEvent::Picked { sku, .. } => Some(sku.clone()),
            _ => None,
        }
    }

    MultiStreamSlicer::new()
        .identity("BinOpened.v1", sku_of)
        .identity("BinStocked.v1", sku_of)
        .identity("BinPicked.v1", sku_of)
        .identities("BinRelabelled.v1", |event| match &event.data {
            BinEvent::Relabelled { from, to } => vec![from.clone(), to.clone()],
            _ => Vec::new(),
        })
}

// ============================================================================
// Runtime and session helpers
// ============================================================================

pub fn bin_storage(store: &InMemoryDocumentStore) -> Arc<InMemoryDocumentStorage<Bin>> {
    Arc::new(InMemoryDocumentStorage::new(BIN_DOCUMENT, store.clone()))
}

pub fn bin_runtime(
    storage: &Arc<InMemoryDocumentStorage<Bin>>,
    cache_limit: usize,
) -> AggregationRuntime<BinAggregator> {
    AggregationRuntime::builder(
        BinAggregator,
        Arc::clone(storage) as _,
        SingleStreamSlicer::new(),
    )
    .cache_limit_per_tenant(cache_limit)
    .build()
    .expect("bin runtime should build")
}

pub fn sku_runtime(store: &InMemoryDocumentStore) -> AggregationRuntime<SkuTotalsAggregator> {
    let storage = Arc::new(InMemoryDocumentStorage::<SkuTotal>::new(
        SKU_DOCUMENT,
        store.clone(),
    ));
    AggregationRuntime::builder(SkuTotalsAggregator, storage as _, sku_slicer())
        .build()
        .expect("sku runtime should build")
}

/// A session collecting operations in an inline unit of work.
pub fn collecting_session(
    mode: ShardExecutionMode,
    outbox: Option<Arc<dyn MessageOutbox>>,
) -> (ProjectionSession, Arc<InlineUnitOfWork>) {
    let unit = Arc::new(InlineUnitOfWork::new(outbox));
    let session = ProjectionSession::new(
        TenantId::default(),
        mode,
        Arc::clone(&unit) as Arc<dyn UnitOfWork>,
    );
    (session, unit)
}

pub fn upserts(operations: &[StorageOperation]) -> Vec<&StorageOperation> {
    operations.iter().filter(|op| op.is_upsert()).collect()
}

/// Deserialize the document carried by an upsert.
pub fn upserted<D: AggregateDocument>(operation: &StorageOperation) -> D {
    match operation {
        StorageOperation::Upsert { data, .. } => {
            serde_json::from_value(data.clone()).expect("upsert should carry the document")
        }
        other => panic!("expected an upsert, got {other:?}"),
    }
}

// ============================================================================
// Shard harness
// ============================================================================

/// Everything a bin shard agent runs against, all in memory.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub log: Arc<InMemoryEventLog<BinEvent>>,
    pub store: InMemoryDocumentStore,
    pub storage: Arc<InMemoryDocumentStorage<Bin>>,
    pub sessions: Arc<InMemorySessionFactory>,
    pub outbox: InMemoryOutbox,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let log = Arc::new(InMemoryEventLog::with_clock(Arc::clone(&clock) as Arc<dyn Clock>));
        let store = InMemoryDocumentStore::new();
        let storage = bin_storage(&store);
        let sessions = Arc::new(
            InMemorySessionFactory::new(store.clone()).with_log(Arc::clone(&log) as _),
        );
        Self {
            clock,
            log,
            store,
            storage,
            sessions,
            outbox: InMemoryOutbox::new(),
        }
    }

    pub fn settings() -> DaemonSettings {
        DaemonSettings::default()
            .with_safe_zone(std::time::Duration::from_secs(3))
            .with_fetching_cooldown(std::time::Duration::from_millis(5))
    }

    pub fn collaborators(
        &self,
        listeners: Vec<Arc<dyn CommitListener>>,
    ) -> ShardCollaborators<BinEvent> {
        ShardCollaborators {
            log: Arc::clone(&self.log) as _,
            source: Arc::clone(&self.log) as _,
            sessions: Arc::clone(&self.sessions) as _,
            clock: Arc::clone(&self.clock) as _,
            listeners,
            outbox: Some(Arc::new(self.outbox.clone())),
        }
    }

    pub fn agent(
        &self,
        cache_limit: usize,
        settings: DaemonSettings,
        listeners: Vec<Arc<dyn CommitListener>>,
    ) -> (ShardAgent<BinEvent>, tokio::sync::watch::Sender<bool>) {
        let runtime = Arc::new(bin_runtime(&self.storage, cache_limit));
        ShardAgent::new(BIN_SHARD, runtime, self.collaborators(listeners), settings)
    }

    pub fn bin(&self, id: &str) -> Option<Bin> {
        self.storage
            .document(&id.to_string())
            .expect("stored bin should deserialize")
    }
}
