//! Aggregation: the capability trait user projections implement and the
//! per-identity slices they fold.
//!
//! # Overview
//!
//! An [`Aggregator`] describes how one document type is built from events:
//!
//! - **create**: build the first version of a document from an event
//! - **apply**: fold a subsequent event into an existing document, either in
//!   place ([`Fold::Keep`]) or by returning a new instance ([`Fold::Replace`])
//! - **delete**: explicit deletion ([`Fold::Delete`]), the
//!   [`should_delete`](Aggregator::should_delete) predicate, or a
//!   delete-trigger event type
//! - **side effects**: additional events and outbound messages raised after a
//!   fold in continuous async mode
//!
//! Dispatch is by `match` on the user's event enum, so no handler discovery
//! happens at runtime.
//!
//! ## Example
//!
//! ```
//! use foldline_core::aggregate::{Aggregator, Fold};
//! use foldline_core::error::BoxError;
//! use foldline_core::event::{Event, EventRecord};
//! use foldline_core::storage::AggregateDocument;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum CounterEvent {
//!     Started,
//!     Incremented,
//!     Closed,
//! }
//!
//! impl Event for CounterEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             CounterEvent::Started => "CounterStarted.v1",
//!             CounterEvent::Incremented => "CounterIncremented.v1",
//!             CounterEvent::Closed => "CounterClosed.v1",
//!         }
//!     }
//! }
//!
//! #[derive(Clone, Debug, Default, Serialize, Deserialize)]
//! struct Counter {
//!     id: String,
//!     count: u32,
//! }
//!
//! impl AggregateDocument for Counter {
//!     type Id = String;
//!     fn identity(&self) -> String {
//!         self.id.clone()
//!     }
//!     fn set_identity(&mut self, id: &String) {
//!         self.id.clone_from(id);
//!     }
//! }
//!
//! struct CounterAggregator;
//!
//! impl Aggregator for CounterAggregator {
//!     type Document = Counter;
//!     type Event = CounterEvent;
//!
//!     fn event_types(&self) -> &[&'static str] {
//!         &["CounterStarted.v1", "CounterIncremented.v1", "CounterClosed.v1"]
//!     }
//!
//!     fn delete_event_types(&self) -> &[&'static str] {
//!         &["CounterClosed.v1"]
//!     }
//!
//!     fn create(&self, event: &EventRecord<CounterEvent>) -> Result<Option<Counter>, BoxError> {
//!         Ok(matches!(event.data, CounterEvent::Started).then(Counter::default))
//!     }
//!
//!     fn apply(&self, counter: &mut Counter, event: &EventRecord<CounterEvent>) -> Result<Fold<Counter>, BoxError> {
//!         if let CounterEvent::Incremented = event.data {
//!             counter.count += 1;
//!         }
//!         Ok(Fold::Keep)
//!     }
//! }
//! ```

use crate::error::BoxError;
use crate::event::{Event, EventError, EventRecord, SerializedEvent, TenantId};
use crate::session::OutboundMessage;
use crate::storage::AggregateDocument;
use crate::stream::{StreamActionType, StreamIdentity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a projection is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionLifecycle {
    /// Applied in the same transaction as the event append.
    Inline,
    /// Applied by a shard agent behind the high-water mark.
    Async,
    /// Built on demand and never persisted.
    Live,
}

/// How a shard agent is currently driving a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardExecutionMode {
    /// Following the live tail of the log.
    Continuous,
    /// Replaying the log from the start after a reset.
    Rebuild,
}

/// Outcome of folding one event into an existing document.
#[derive(Debug, Clone, PartialEq)]
pub enum Fold<D> {
    /// The document was mutated in place (or left untouched).
    Keep,
    /// The fold produced a new instance that replaces the document.
    Replace(D),
    /// The document is deleted.
    Delete,
}

/// Prior state of a slice's aggregate.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AggregateState<D> {
    /// Not loaded yet.
    #[default]
    NotLoaded,
    /// Resolved; `None` means the aggregate does not exist.
    Loaded(Option<D>),
}

impl<D> AggregateState<D> {
    /// Whether the state has been resolved.
    #[must_use]
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }
}

/// An event raised as a side effect, to be appended in the same batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RaisedEvent {
    /// Stream the event is appended to.
    pub stream: StreamIdentity,
    /// Serialized event.
    pub event: SerializedEvent,
}

/// One aggregate identity's events for a single processing pass.
#[derive(Debug, Clone)]
pub struct EventSlice<D: AggregateDocument, E> {
    id: D::Id,
    tenant_id: TenantId,
    events: Vec<Arc<EventRecord<E>>>,
    action: StreamActionType,
    prior: AggregateState<D>,
    aggregate: Option<D>,
    raised_events: Vec<RaisedEvent>,
    published_messages: Vec<OutboundMessage>,
}

impl<D: AggregateDocument, E> EventSlice<D, E> {
    /// Create an empty slice.
    #[must_use]
    pub const fn new(id: D::Id, tenant_id: TenantId, action: StreamActionType) -> Self {
        Self {
            id,
            tenant_id,
            events: Vec::new(),
            action,
            prior: AggregateState::NotLoaded,
            aggregate: None,
            raised_events: Vec::new(),
            published_messages: Vec::new(),
        }
    }

    /// Create a slice holding `events`, already in fold order.
    #[must_use]
    pub fn with_events(
        id: D::Id,
        tenant_id: TenantId,
        action: StreamActionType,
        events: Vec<Arc<EventRecord<E>>>,
    ) -> Self {
        let mut slice = Self::new(id, tenant_id, action);
        slice.events = events;
        slice
    }

    /// Aggregate identity.
    #[must_use]
    pub const fn id(&self) -> &D::Id {
        &self.id
    }

    /// Owning tenant.
    #[must_use]
    pub const fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Events in fold order.
    #[must_use]
    pub fn events(&self) -> &[Arc<EventRecord<E>>] {
        &self.events
    }

    /// Append an event. Slicers keep events in fold order.
    pub fn push_event(&mut self, event: Arc<EventRecord<E>>) {
        self.events.push(event);
    }

    /// Last event of the slice.
    #[must_use]
    pub fn last_event(&self) -> Option<&EventRecord<E>> {
        self.events.last().map(AsRef::as_ref)
    }

    /// Whether the slice starts its stream or appends to it.
    #[must_use]
    pub const fn action(&self) -> StreamActionType {
        self.action
    }

    /// Override the action kind.
    pub const fn set_action(&mut self, action: StreamActionType) {
        self.action = action;
    }

    /// Prior aggregate state.
    #[must_use]
    pub const fn prior(&self) -> &AggregateState<D> {
        &self.prior
    }

    /// Record the resolved prior state (from the cache or a multi-get).
    pub fn set_prior(&mut self, prior: Option<D>) {
        self.prior = AggregateState::Loaded(prior);
    }

    /// Take the prior state, leaving it loaded-but-absent.
    pub fn take_prior(&mut self) -> AggregateState<D> {
        std::mem::replace(&mut self.prior, AggregateState::Loaded(None))
    }

    /// Aggregate produced by the fold.
    #[must_use]
    pub const fn aggregate(&self) -> Option<&D> {
        self.aggregate.as_ref()
    }

    /// Replace the folded aggregate.
    pub fn set_aggregate(&mut self, aggregate: Option<D>) {
        self.aggregate = aggregate;
    }

    /// Raise a side-effect event to be appended to `stream`.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be
    /// serialized.
    pub fn raise_event<T: Event + Serialize>(
        &mut self,
        stream: StreamIdentity,
        event: &T,
    ) -> Result<(), EventError> {
        self.raised_events.push(RaisedEvent {
            stream,
            event: SerializedEvent::from_event(event, None)?,
        });
        Ok(())
    }

    /// Events raised as side effects, in raise order.
    #[must_use]
    pub fn raised_events(&self) -> &[RaisedEvent] {
        &self.raised_events
    }

    /// Queue an outbound message published when the batch commits.
    pub fn publish_message(&mut self, message: OutboundMessage) {
        self.published_messages.push(message);
    }

    /// Messages queued as side effects, in publish order.
    #[must_use]
    pub fn published_messages(&self) -> &[OutboundMessage] {
        &self.published_messages
    }

    /// Take raised events and messages, leaving both empty.
    pub fn take_side_effects(&mut self) -> (Vec<RaisedEvent>, Vec<OutboundMessage>) {
        (
            std::mem::take(&mut self.raised_events),
            std::mem::take(&mut self.published_messages),
        )
    }
}

/// Slices of one tenant, in first-appearance order.
#[derive(Debug, Clone)]
pub struct TenantSliceGroup<D: AggregateDocument, E> {
    /// Tenant the slices belong to.
    pub tenant_id: TenantId,
    /// Slices for the tenant.
    pub slices: Vec<EventSlice<D, E>>,
}

impl<D: AggregateDocument, E> TenantSliceGroup<D, E> {
    /// Create an empty group.
    #[must_use]
    pub const fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            slices: Vec::new(),
        }
    }

    /// Total number of events across all slices.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.slices.iter().map(|slice| slice.events().len()).sum()
    }
}

/// Capability trait describing how a document type is folded from events.
///
/// Only [`event_types`](Self::event_types) and [`apply`](Self::apply) are
/// required. Fold failures are reported as [`BoxError`]; a
/// [`StorageError`](crate::error::StorageError) returned here propagates
/// unwrapped, anything else is wrapped with the offending event's identity.
pub trait Aggregator: Send + Sync + 'static {
    /// Document produced by the fold.
    type Document: AggregateDocument;

    /// Event type folded.
    type Event: Event;

    /// Event types this aggregator handles. Other events are filtered out
    /// before slicing.
    fn event_types(&self) -> &[&'static str];

    /// Event types whose presence in a slice deletes the document outright.
    fn delete_event_types(&self) -> &[&'static str] {
        &[]
    }

    /// Build a new document from `event` when no prior document exists.
    ///
    /// Returning `None` falls back to
    /// [`default_document`](Self::default_document) followed by
    /// [`apply`](Self::apply).
    ///
    /// # Errors
    ///
    /// Returns the user's failure; see the trait docs for how it is classified.
    fn create(
        &self,
        _event: &EventRecord<Self::Event>,
    ) -> Result<Option<Self::Document>, BoxError> {
        Ok(None)
    }

    /// Empty document to fold into when [`create`](Self::create) declines.
    fn default_document(&self) -> Option<Self::Document> {
        None
    }

    /// Fold `event` into an existing document.
    ///
    /// # Errors
    ///
    /// Returns the user's failure; see the trait docs for how it is classified.
    fn apply(
        &self,
        aggregate: &mut Self::Document,
        event: &EventRecord<Self::Event>,
    ) -> Result<Fold<Self::Document>, BoxError>;

    /// Deletion predicate evaluated after each folded event.
    fn should_delete(
        &self,
        _aggregate: &Self::Document,
        _event: &EventRecord<Self::Event>,
    ) -> bool {
        false
    }

    /// Copy metadata from the last folded event onto the document.
    fn apply_metadata(
        &self,
        aggregate: Self::Document,
        _last_event: &EventRecord<Self::Event>,
    ) -> Self::Document {
        aggregate
    }

    /// Raise side-effect events or messages after a fold.
    ///
    /// Only invoked in continuous async mode, never during a rebuild.
    ///
    /// # Errors
    ///
    /// Returns the user's failure, wrapped with the slice's last event.
    fn raise_side_effects(
        &self,
        _slice: &mut EventSlice<Self::Document, Self::Event>,
    ) -> Result<(), BoxError> {
        Ok(())
    }
}
