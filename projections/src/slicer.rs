//! Event slicing: grouping a fetched range into per-identity work units.
//!
//! Slicers are pure. They never load aggregate state; the runtime resolves
//! prior state afterwards, for all slices of a tenant at once.

use foldline_core::aggregate::{EventSlice, TenantSliceGroup};
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{Event, EventRecord, TenantId};
use foldline_core::identity::AggregateIdentity;
use foldline_core::storage::AggregateDocument;
use foldline_core::stream::StreamActionType;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// Groups events into slices, per tenant.
pub trait EventSlicer<D: AggregateDocument, E>: Send + Sync {
    /// Partition `events` (ascending by sequence) into tenant groups of
    /// slices, both in first-appearance order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if an event cannot be
    /// mapped to an identity.
    fn slice_async_events(
        &self,
        events: &[Arc<EventRecord<E>>],
    ) -> Result<Vec<TenantSliceGroup<D, E>>>;

    /// Whether slices correspond one-to-one with streams.
    fn is_single_stream(&self) -> bool;

    /// Check at setup that every event type in `handled_types` can be sliced.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] naming the first type that
    /// cannot.
    fn validate(&self, _handled_types: &[&'static str]) -> Result<()> {
        Ok(())
    }
}

/// Builds tenant groups while preserving first-appearance order.
struct SliceGrouper<D: AggregateDocument, E> {
    groups: Vec<TenantSliceGroup<D, E>>,
    tenants: HashMap<TenantId, usize>,
    slices: HashMap<(usize, D::Id), usize>,
}

impl<D: AggregateDocument, E> SliceGrouper<D, E> {
    fn new() -> Self {
        Self {
            groups: Vec::new(),
            tenants: HashMap::new(),
            slices: HashMap::new(),
        }
    }

    fn push(&mut self, tenant_id: &TenantId, id: D::Id, event: Arc<EventRecord<E>>) {
        let group_index = match self.tenants.get(tenant_id) {
            Some(index) => *index,
            None => {
                self.groups.push(TenantSliceGroup::new(tenant_id.clone()));
                let index = self.groups.len() - 1;
                self.tenants.insert(tenant_id.clone(), index);
                index
            }
        };

        let group = &mut self.groups[group_index];
        let slice_index = *self
            .slices
            .entry((group_index, id.clone()))
            .or_insert_with(|| {
                group.slices.push(EventSlice::new(
                    id,
                    tenant_id.clone(),
                    StreamActionType::Append,
                ));
                group.slices.len() - 1
            });

        group.slices[slice_index].push_event(event);
    }

    fn finish(self) -> Vec<TenantSliceGroup<D, E>> {
        self.groups
    }
}

/// Slicer for aggregates built from exactly one stream.
///
/// The identity is the stream identity, converted through
/// [`AggregateIdentity::from_stream`]. Events in a slice are ordered by
/// stream version, and a slice whose first event is version 1 is a
/// [`StreamActionType::Start`].
pub struct SingleStreamSlicer<D, E> {
    _marker: PhantomData<fn() -> (D, E)>,
}

impl<D, E> SingleStreamSlicer<D, E> {
    /// Create a slicer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<D, E> Default for SingleStreamSlicer<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> EventSlicer<D, E> for SingleStreamSlicer<D, E>
where
    D: AggregateDocument,
    E: Event,
{
    fn slice_async_events(
        &self,
        events: &[Arc<EventRecord<E>>],
    ) -> Result<Vec<TenantSliceGroup<D, E>>> {
        let mut grouper = SliceGrouper::<D, E>::new();
        for event in events {
            let id = D::Id::from_stream(&event.stream).ok_or_else(|| {
                ProjectionError::Configuration(format!(
                    "stream '{}' cannot be converted to the aggregate identity type",
                    event.stream
                ))
            })?;
            grouper.push(&event.tenant_id, id, Arc::clone(event));
        }

        let mut groups = grouper.finish();
        for slice in groups.iter_mut().flat_map(|g| g.slices.iter_mut()) {
            let mut ordered = slice.events().to_vec();
            ordered.sort_by_key(|event| event.version);
            let action = if ordered.first().is_some_and(|event| event.version == 1) {
                StreamActionType::Start
            } else {
                StreamActionType::Append
            };
            *slice = EventSlice::with_events(slice.id().clone(), slice.tenant_id().clone(), action, ordered);
        }
        Ok(groups)
    }

    fn is_single_stream(&self) -> bool {
        true
    }
}

/// Function deriving target identities from one event.
pub type IdentityFn<E, Id> = Arc<dyn Fn(&EventRecord<E>) -> Vec<Id> + Send + Sync>;

/// Slicer for aggregates built from events of several streams.
///
/// Each event type routes through its registered identity function, which
/// may yield several identities (fan-out). Slices are ordered by global
/// sequence and always [`StreamActionType::Append`].
///
/// # Example
///
/// ```ignore
/// let slicer = MultiStreamSlicer::new()
///     .identity("InvoiceIssued.v1", |event| match &event.data {
///         BillingEvent::InvoiceIssued { customer_id, .. } => Some(*customer_id),
///         _ => None,
///     })
///     .identities("CustomersMerged.v1", |event| match &event.data {
///         BillingEvent::CustomersMerged { from, into } => vec![*from, *into],
///         _ => Vec::new(),
///     });
/// ```
pub struct MultiStreamSlicer<D: AggregateDocument, E> {
    routes: HashMap<&'static str, IdentityFn<E, D::Id>>,
}

impl<D: AggregateDocument, E> MultiStreamSlicer<D, E> {
    /// Create a slicer with no routes.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Route `event_type` to at most one identity.
    #[must_use]
    pub fn identity<F>(self, event_type: &'static str, route: F) -> Self
    where
        F: Fn(&EventRecord<E>) -> Option<D::Id> + Send + Sync + 'static,
    {
        self.identities(event_type, move |event| route(event).into_iter().collect())
    }

    /// Route `event_type` to any number of identities.
    #[must_use]
    pub fn identities<F>(mut self, event_type: &'static str, route: F) -> Self
    where
        F: Fn(&EventRecord<E>) -> Vec<D::Id> + Send + Sync + 'static,
    {
        self.routes.insert(event_type, Arc::new(route));
        self
    }

    /// Event types with a registered route.
    pub fn routed_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }
}

impl<D: AggregateDocument, E> Default for MultiStreamSlicer<D, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D, E> EventSlicer<D, E> for MultiStreamSlicer<D, E>
where
    D: AggregateDocument,
    E: Event,
{
    fn slice_async_events(
        &self,
        events: &[Arc<EventRecord<E>>],
    ) -> Result<Vec<TenantSliceGroup<D, E>>> {
        let mut grouper = SliceGrouper::<D, E>::new();
        for event in events {
            let event_type = event.event_type();
            let route = self.routes.get(event_type).ok_or_else(|| {
                ProjectionError::Configuration(format!(
                    "no identity function registered for event type '{event_type}'"
                ))
            })?;

            let mut seen = HashSet::new();
            for id in route(event) {
                if seen.insert(id.clone()) {
                    grouper.push(&event.tenant_id, id, Arc::clone(event));
                }
            }
        }

        let mut groups = grouper.finish();
        for slice in groups.iter_mut().flat_map(|g| g.slices.iter_mut()) {
            if slice.events().windows(2).any(|w| w[0].sequence > w[1].sequence) {
                let mut ordered = slice.events().to_vec();
                ordered.sort_by_key(|event| event.sequence);
                *slice = EventSlice::with_events(
                    slice.id().clone(),
                    slice.tenant_id().clone(),
                    StreamActionType::Append,
                    ordered,
                );
            }
        }
        Ok(groups)
    }

    fn is_single_stream(&self) -> bool {
        false
    }

    fn validate(&self, handled_types: &[&'static str]) -> Result<()> {
        match handled_types
            .iter()
            .find(|event_type| !self.routes.contains_key(**event_type))
        {
            Some(missing) => Err(ProjectionError::Configuration(format!(
                "multi-stream projection handles '{missing}' but has no identity function for it"
            ))),
            None => Ok(()),
        }
    }
}
