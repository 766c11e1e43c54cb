//! Aggregation runtime.
//!
//! [`AggregationRuntime`] folds [`EventSlice`]s into aggregate documents and
//! turns the result into storage operations queued on the session's unit of
//! work. One runtime exists per document type; it owns that type's
//! per-tenant aggregate caches.
//!
//! # Slice lifecycle
//!
//! ```text
//! NotLoaded ──▶ Loaded(aggregate or absent) ──▶ Applying ──▶ Deleted | Upserted
//! ```
//!
//! For async shards, [`process_group`](AggregationRuntime::process_group)
//! resolves prior state for a whole tenant group before any folding starts:
//! new streams skip the cache, cached identities reuse the cached document,
//! and everything else is fetched with a single `load_many`. The cache is
//! therefore never mutated while slices fold concurrently.

use crate::cache::{AggregateCache, NulloAggregateCache, RecentlyUsedCache};
use crate::metrics::AggregationMetrics;
use crate::session::{IdentityMap, ProjectionSession};
use crate::slicer::EventSlicer;
use foldline_core::aggregate::{
    AggregateState, Aggregator, EventSlice, Fold, ProjectionLifecycle, RaisedEvent,
    ShardExecutionMode, TenantSliceGroup,
};
use foldline_core::cancellation::CancellationSignal;
use foldline_core::config::DaemonSettings;
use foldline_core::environment::{Clock, SystemClock};
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{EventRecord, TenantId};
use foldline_core::identity::AggregateIdentity;
use foldline_core::operation::{AppendEvents, PendingEvent, StorageOperation};
use foldline_core::session::OutboundMessage;
use foldline_core::storage::{AggregateDocument, DocumentStorage};
use foldline_core::stream::StreamActionType;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

type Doc<A> = <A as Aggregator>::Document;
type Ev<A> = <A as Aggregator>::Event;
type DocId<A> = <Doc<A> as AggregateDocument>::Id;
type Slice<A> = EventSlice<Doc<A>, Ev<A>>;
type TenantCache<A> = Arc<dyn AggregateCache<DocId<A>, Doc<A>>>;
type TenantCaches<A> = HashMap<TenantId, TenantCache<A>>;

/// Per-projection runtime options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Aggregates cached per tenant. `0` disables caching.
    pub cache_limit_per_tenant: usize,
    /// Resolve inline prior state through the session's identity map.
    pub use_identity_map_for_inline: bool,
    /// Slices folded concurrently within one tenant group.
    pub max_slice_parallelism: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            cache_limit_per_tenant: 0,
            use_identity_map_for_inline: false,
            max_slice_parallelism: 8,
        }
    }
}

impl RuntimeOptions {
    /// Defaults, with parallelism taken from the daemon settings.
    #[must_use]
    pub fn from_settings(settings: &DaemonSettings) -> Self {
        Self::default().with_max_slice_parallelism(settings.max_slice_parallelism)
    }

    /// Set the per-tenant cache limit.
    #[must_use]
    pub const fn with_cache_limit_per_tenant(mut self, limit: usize) -> Self {
        self.cache_limit_per_tenant = limit;
        self
    }

    /// Enable or disable the identity map for inline projections.
    #[must_use]
    pub const fn with_identity_map_for_inline(mut self, enabled: bool) -> Self {
        self.use_identity_map_for_inline = enabled;
        self
    }

    /// Set fold parallelism.
    #[must_use]
    pub const fn with_max_slice_parallelism(mut self, parallelism: usize) -> Self {
        self.max_slice_parallelism = parallelism;
        self
    }
}

/// Builder for [`AggregationRuntime`].
pub struct AggregationRuntimeBuilder<A: Aggregator> {
    aggregator: A,
    storage: Arc<dyn DocumentStorage<Doc<A>>>,
    slicer: Arc<dyn EventSlicer<Doc<A>, Ev<A>>>,
    clock: Arc<dyn Clock>,
    options: RuntimeOptions,
}

impl<A: Aggregator> AggregationRuntimeBuilder<A> {
    /// Replace all options at once.
    #[must_use]
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the per-tenant cache limit. `0` disables caching.
    #[must_use]
    pub fn cache_limit_per_tenant(mut self, limit: usize) -> Self {
        self.options.cache_limit_per_tenant = limit;
        self
    }

    /// Resolve inline prior state through the session's identity map.
    #[must_use]
    pub fn use_identity_map_for_inline(mut self, enabled: bool) -> Self {
        self.options.use_identity_map_for_inline = enabled;
        self
    }

    /// Set fold parallelism.
    #[must_use]
    pub fn max_slice_parallelism(mut self, parallelism: usize) -> Self {
        self.options.max_slice_parallelism = parallelism;
        self
    }

    /// Clock used to timestamp raised events.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and build the runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if parallelism is zero or
    /// the slicer cannot route every handled event type.
    pub fn build(self) -> Result<AggregationRuntime<A>> {
        if self.options.max_slice_parallelism == 0 {
            return Err(ProjectionError::Configuration(
                "max_slice_parallelism must be > 0".to_string(),
            ));
        }
        if self.aggregator.event_types().is_empty() {
            return Err(ProjectionError::Configuration(format!(
                "{} handles no event types",
                std::any::type_name::<A>()
            )));
        }
        self.slicer.validate(self.aggregator.event_types())?;

        tracing::debug!(
            document_type = self.storage.document_type(),
            single_stream = self.slicer.is_single_stream(),
            cache_limit = self.options.cache_limit_per_tenant,
            "Aggregation runtime built"
        );

        Ok(AggregationRuntime {
            aggregator: self.aggregator,
            storage: self.storage,
            slicer: self.slicer,
            clock: self.clock,
            options: self.options,
            caches: Mutex::new(Arc::new(HashMap::new())),
        })
    }
}

/// Folds slices of one document type into storage operations.
pub struct AggregationRuntime<A: Aggregator> {
    aggregator: A,
    storage: Arc<dyn DocumentStorage<Doc<A>>>,
    slicer: Arc<dyn EventSlicer<Doc<A>, Ev<A>>>,
    clock: Arc<dyn Clock>,
    options: RuntimeOptions,
    /// Copy-on-write snapshot; the lock is only held to swap it.
    caches: Mutex<Arc<TenantCaches<A>>>,
}

impl<A: Aggregator> AggregationRuntime<A> {
    /// Start building a runtime.
    #[must_use]
    pub fn builder<S>(
        aggregator: A,
        storage: Arc<dyn DocumentStorage<Doc<A>>>,
        slicer: S,
    ) -> AggregationRuntimeBuilder<A>
    where
        S: EventSlicer<Doc<A>, Ev<A>> + 'static,
    {
        AggregationRuntimeBuilder {
            aggregator,
            storage,
            slicer: Arc::new(slicer),
            clock: Arc::new(SystemClock),
            options: RuntimeOptions::default(),
        }
    }

    /// The user's aggregator.
    #[must_use]
    pub const fn aggregator(&self) -> &A {
        &self.aggregator
    }

    /// Effective options.
    #[must_use]
    pub const fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Document type written by this runtime.
    #[must_use]
    pub fn document_type(&self) -> &str {
        self.storage.document_type()
    }

    /// Whether slices map one-to-one onto streams.
    #[must_use]
    pub fn is_single_stream(&self) -> bool {
        self.slicer.is_single_stream()
    }

    /// Slice `events`, ignoring types the aggregator does not handle.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] if an event cannot be
    /// mapped to an identity.
    pub fn slice(
        &self,
        events: &[Arc<EventRecord<Ev<A>>>],
    ) -> Result<Vec<TenantSliceGroup<Doc<A>, Ev<A>>>> {
        let handled = self.aggregator.event_types();
        let relevant: Vec<_> = events
            .iter()
            .filter(|event| handled.contains(&event.event_type()))
            .cloned()
            .collect();
        self.slicer.slice_async_events(&relevant)
    }

    fn caches(&self) -> MutexGuard<'_, Arc<TenantCaches<A>>> {
        self.caches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The aggregate cache of `tenant_id`, created on first use.
    #[must_use]
    pub fn cache_for(&self, tenant_id: &TenantId) -> TenantCache<A> {
        let snapshot = Arc::clone(&*self.caches());
        if let Some(cache) = snapshot.get(tenant_id) {
            return Arc::clone(cache);
        }

        let mut caches = self.caches();
        // Another caller may have published the tenant since the snapshot.
        if let Some(cache) = caches.get(tenant_id) {
            return Arc::clone(cache);
        }

        let cache: TenantCache<A> = match self.options.cache_limit_per_tenant {
            0 => Arc::new(NulloAggregateCache),
            limit => Arc::new(RecentlyUsedCache::new(limit)),
        };
        let mut next = TenantCaches::<A>::clone(&caches);
        next.insert(tenant_id.clone(), Arc::clone(&cache));
        *caches = Arc::new(next);
        cache
    }

    /// Drop every cached aggregate, for all tenants.
    ///
    /// Called when a pass fails after folding, since the cache may then hold
    /// state that was never committed.
    pub fn clear_caches(&self) {
        *self.caches() = Arc::new(HashMap::new());
    }

    /// Identity of the aggregate `event` belongs to.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] for multi-stream
    /// projections, whose identities are only known to the slicer, or if the
    /// stream identity does not convert.
    pub fn identity_from_event(&self, event: &EventRecord<Ev<A>>) -> Result<DocId<A>> {
        if !self.slicer.is_single_stream() {
            return Err(ProjectionError::Configuration(
                "identity derivation from an event is not supported for multi-stream projections"
                    .to_string(),
            ));
        }
        <DocId<A> as AggregateIdentity>::from_stream(&event.stream).ok_or_else(|| {
            ProjectionError::Configuration(format!(
                "stream {} does not convert to {}",
                event.stream,
                std::any::type_name::<DocId<A>>()
            ))
        })
    }

    /// Fold `slice` and queue the resulting operations on the session's
    /// unit of work in one atomic call.
    ///
    /// Side effects are raised only for async projections in continuous
    /// mode. A cancelled signal or an empty slice is a no-op.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Storage`] if loading fails or user code returns a
    ///   storage error
    /// - [`ProjectionError::ApplyEvent`] if folding fails
    #[tracing::instrument(
        skip_all,
        name = "aggregation.apply_changes",
        fields(id = %slice.id(), tenant = %slice.tenant_id(), events = slice.events().len())
    )]
    pub async fn apply_changes(
        &self,
        session: &ProjectionSession,
        slice: &mut Slice<A>,
        lifecycle: ProjectionLifecycle,
        cancel: &CancellationSignal,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let Some(last) = slice.events().last().cloned() else {
            return Ok(());
        };

        let shard_driven = lifecycle == ProjectionLifecycle::Async;
        let continuous_async = shard_driven && session.mode() == ShardExecutionMode::Continuous;
        let id = slice.id().clone();
        let tenant_id = slice.tenant_id().clone();
        let mut operations = Vec::new();
        let mut messages = Vec::new();

        if self.has_delete_trigger(slice) {
            if continuous_async {
                messages = self.raise_side_effects(slice, &mut operations)?;
            }
            operations.push(self.storage.delete_for_id(&tenant_id, &id));
            slice.set_aggregate(None);
            if let Some(map) = self.identity_map(session, lifecycle) {
                map.store::<Doc<A>>(&id, None);
            }
            tracing::debug!(%id, "Delete event in slice; deleting aggregate");
            return self.enqueue(session, operations, messages).await;
        }

        let prior = self.resolve_prior(session, slice, lifecycle).await?;
        let exists = prior.is_some();
        let aggregate = self.fold(prior, slice.events())?;

        if let Some(map) = self.identity_map(session, lifecycle) {
            map.store::<Doc<A>>(&id, aggregate.clone());
        }

        match aggregate {
            None => {
                if exists {
                    operations.push(self.storage.delete_for_id(&tenant_id, &id));
                }
                slice.set_aggregate(None);
            }
            Some(mut document) => {
                let single_stream = self.slicer.is_single_stream();
                document.set_identity(&id);
                if single_stream {
                    document.set_version(last.version);
                }
                let document = self.aggregator.apply_metadata(document, &last);
                operations.push(self.storage.upsert(
                    &tenant_id,
                    &document,
                    single_stream.then_some(last.version),
                    // The shard serializes writes per identity, and a rebuild
                    // re-folds over documents that already exist.
                    shard_driven,
                )?);
                slice.set_aggregate(Some(document));
            }
        }

        if continuous_async {
            messages = self.raise_side_effects(slice, &mut operations)?;
        }

        AggregationMetrics::record_applied(self.document_type(), slice.events().len());
        self.enqueue(session, operations, messages).await
    }

    /// Resolve prior state for every slice of `group`, fold them with
    /// bounded parallelism and queue their operations.
    ///
    /// Returns the folded slices. Every failing slice is logged; sibling
    /// slices still complete, then the first failure is returned.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Storage`] if the multi-get fails
    /// - the first slice failure otherwise
    #[tracing::instrument(
        skip_all,
        name = "aggregation.process_group",
        fields(tenant = %group.tenant_id, slices = group.slices.len())
    )]
    pub async fn process_group(
        &self,
        session: &ProjectionSession,
        group: TenantSliceGroup<Doc<A>, Ev<A>>,
        cancel: &CancellationSignal,
    ) -> Result<Vec<Slice<A>>> {
        let TenantSliceGroup {
            tenant_id,
            mut slices,
        } = group;
        if slices.is_empty() || cancel.is_cancelled() {
            return Ok(slices);
        }

        let session = session.for_tenant(tenant_id.clone());
        let cache = self.cache_for(&tenant_id);
        self.resolve_priors(&tenant_id, cache.as_ref(), &mut slices)
            .await?;

        // Built in a loop rather than a closure so the pass future stays
        // `Send` for `tokio::spawn`.
        let mut folds = Vec::with_capacity(slices.len());
        for slice in &mut slices {
            folds.push(self.apply_changes(&session, slice, ProjectionLifecycle::Async, cancel));
        }
        let results: Vec<Result<()>> = stream::iter(folds)
            .buffered(self.options.max_slice_parallelism.max(1))
            .collect()
            .await;

        let mut failures = 0;
        let mut first_error = None;
        for (slice, result) in slices.iter().zip(results) {
            if let Err(e) = result {
                failures += 1;
                tracing::error!(
                    id = %slice.id(),
                    tenant = %tenant_id,
                    error = %e,
                    "Failed to apply slice"
                );
                first_error.get_or_insert(e);
            }
        }

        if let Some(e) = first_error {
            AggregationMetrics::record_failures(self.document_type(), failures);
            for slice in &slices {
                cache.remove(slice.id());
            }
            return Err(e);
        }

        if cancel.is_cancelled() {
            // Some slices may have folded without their operations being
            // accepted.
            for slice in &slices {
                cache.remove(slice.id());
            }
        } else {
            for slice in &slices {
                match slice.aggregate() {
                    Some(document) => cache.store(slice.id().clone(), document.clone()),
                    None => cache.remove(slice.id()),
                }
            }
        }
        cache.compact_if_necessary();

        Ok(slices)
    }

    /// Slice freshly appended events and apply them inline, in the caller's
    /// unit of work. Slices are applied one after another.
    ///
    /// # Errors
    ///
    /// Returns the first slicing or folding failure.
    #[tracing::instrument(skip_all, name = "aggregation.apply_inline", fields(events = events.len()))]
    pub async fn apply_inline(
        &self,
        session: &ProjectionSession,
        events: &[Arc<EventRecord<Ev<A>>>],
        cancel: &CancellationSignal,
    ) -> Result<()> {
        for group in self.slice(events)? {
            let tenant_session = session.for_tenant(group.tenant_id.clone());
            for mut slice in group.slices {
                self.apply_changes(&tenant_session, &mut slice, ProjectionLifecycle::Inline, cancel)
                    .await?;
            }
        }
        Ok(())
    }

    /// Fold `events` into a document without loading or persisting anything.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::ApplyEvent`] if folding fails.
    pub fn aggregate_live(
        &self,
        id: &DocId<A>,
        events: &[Arc<EventRecord<Ev<A>>>],
    ) -> Result<Option<Doc<A>>> {
        let Some(last) = events.last() else {
            return Ok(None);
        };
        let Some(mut document) = self.fold(None, events)? else {
            return Ok(None);
        };
        document.set_identity(id);
        if self.slicer.is_single_stream() {
            document.set_version(last.version);
        }
        Ok(Some(self.aggregator.apply_metadata(document, last)))
    }

    /// Cache partitioning, run single-threaded before any folding.
    async fn resolve_priors(
        &self,
        tenant_id: &TenantId,
        cache: &dyn AggregateCache<DocId<A>, Doc<A>>,
        slices: &mut [Slice<A>],
    ) -> Result<()> {
        let single_stream = self.slicer.is_single_stream();
        let mut hits = 0;
        let mut misses = Vec::new();

        for (index, slice) in slices.iter_mut().enumerate() {
            if slice.prior().is_loaded()
                || (single_stream && slice.action() == StreamActionType::Start)
            {
                continue;
            }
            match cache.try_find(slice.id()) {
                Some(cached) => {
                    slice.set_prior(Some(cached));
                    hits += 1;
                }
                None => misses.push(index),
            }
        }

        if !misses.is_empty() {
            let ids: Vec<DocId<A>> = misses.iter().map(|&i| slices[i].id().clone()).collect();
            let loaded = self.storage.load_many(tenant_id, &ids).await?;
            let mut by_id: HashMap<DocId<A>, Doc<A>> = loaded
                .into_iter()
                .map(|document| (document.identity(), document))
                .collect();

            for &index in &misses {
                let slice = &mut slices[index];
                let prior = by_id.remove(slice.id());
                if let Some(document) = &prior {
                    cache.store(slice.id().clone(), document.clone());
                }
                slice.set_prior(prior);
            }
        }

        tracing::debug!(hits, misses = misses.len(), "Resolved prior aggregates");
        AggregationMetrics::record_cache(self.document_type(), hits, misses.len());
        Ok(())
    }

    async fn resolve_prior(
        &self,
        session: &ProjectionSession,
        slice: &mut Slice<A>,
        lifecycle: ProjectionLifecycle,
    ) -> Result<Option<Doc<A>>> {
        if let AggregateState::Loaded(prior) = slice.take_prior() {
            return Ok(prior);
        }
        if self.slicer.is_single_stream() && slice.action() == StreamActionType::Start {
            return Ok(None);
        }

        let id = slice.id().clone();
        let tenant_id = slice.tenant_id().clone();
        let Some(map) = self.identity_map(session, lifecycle) else {
            return Ok(self.storage.load(&tenant_id, &id).await?);
        };

        if let Some(tracked) = map.get::<Doc<A>>(&id) {
            return Ok(tracked);
        }
        let loaded = self.storage.load(&tenant_id, &id).await?;
        map.store(&id, loaded.clone());
        Ok(loaded)
    }

    fn identity_map<'s>(
        &self,
        session: &'s ProjectionSession,
        lifecycle: ProjectionLifecycle,
    ) -> Option<&'s IdentityMap> {
        if lifecycle == ProjectionLifecycle::Inline && self.options.use_identity_map_for_inline {
            session.identity_map()
        } else {
            None
        }
    }

    fn has_delete_trigger(&self, slice: &Slice<A>) -> bool {
        let triggers = self.aggregator.delete_event_types();
        !triggers.is_empty()
            && slice
                .events()
                .iter()
                .any(|event| triggers.contains(&event.event_type()))
    }

    fn fold(
        &self,
        mut aggregate: Option<Doc<A>>,
        events: &[Arc<EventRecord<Ev<A>>>],
    ) -> Result<Option<Doc<A>>> {
        for event in events {
            let event: &EventRecord<Ev<A>> = event;
            aggregate = match aggregate.take() {
                None => self.create(event)?,
                Some(current) => self.apply_one(current, event)?,
            };
            if aggregate
                .as_ref()
                .is_some_and(|document| self.aggregator.should_delete(document, event))
            {
                aggregate = None;
            }
        }
        Ok(aggregate)
    }

    fn create(&self, event: &EventRecord<Ev<A>>) -> Result<Option<Doc<A>>> {
        if let Some(document) = self
            .aggregator
            .create(event)
            .map_err(|e| ProjectionError::from_fold_failure(event, e))?
        {
            return Ok(Some(document));
        }

        match self.aggregator.default_document() {
            Some(document) => self.apply_one(document, event),
            None => Err(ProjectionError::from_fold_failure(
                event,
                format!(
                    "{} cannot be created from {}: no create result and no default document",
                    std::any::type_name::<Doc<A>>(),
                    event.event_type()
                )
                .into(),
            )),
        }
    }

    fn apply_one(
        &self,
        mut current: Doc<A>,
        event: &EventRecord<Ev<A>>,
    ) -> Result<Option<Doc<A>>> {
        let outcome = self
            .aggregator
            .apply(&mut current, event)
            .map_err(|e| ProjectionError::from_fold_failure(event, e))?;
        Ok(match outcome {
            Fold::Keep => Some(current),
            Fold::Replace(next) => Some(next),
            Fold::Delete => None,
        })
    }

    /// Run the aggregator's side-effect hook, turning raised events into
    /// appends. Messages are returned for publication once the slice's
    /// operations are accepted.
    fn raise_side_effects(
        &self,
        slice: &mut Slice<A>,
        operations: &mut Vec<StorageOperation>,
    ) -> Result<Vec<OutboundMessage>> {
        let Some(last) = slice.events().last().cloned() else {
            return Ok(Vec::new());
        };
        self.aggregator
            .raise_side_effects(slice)
            .map_err(|e| ProjectionError::from_fold_failure(&*last, e))?;

        let (raised, messages) = slice.take_side_effects();
        operations.extend(
            self.append_operations(slice, raised)
                .into_iter()
                .map(StorageOperation::AppendEvents),
        );
        Ok(messages)
    }

    /// Group raised events into one append per stream, in raise order.
    ///
    /// A single-stream slice that starts its stream knows the stream's tip,
    /// so events raised back onto that stream get explicit versions.
    fn append_operations(&self, slice: &Slice<A>, raised: Vec<RaisedEvent>) -> Vec<AppendEvents> {
        let now = self.clock.now();
        let mut appends: Vec<AppendEvents> = Vec::new();
        for RaisedEvent { stream, event } in raised {
            let pending = PendingEvent {
                id: Uuid::new_v4(),
                version: None,
                event,
                timestamp: now,
            };
            match appends.iter_mut().find(|append| append.stream == stream) {
                Some(append) => append.events.push(pending),
                None => appends.push(AppendEvents {
                    tenant_id: slice.tenant_id().clone(),
                    stream,
                    expected_version: None,
                    events: vec![pending],
                }),
            }
        }

        let known_tip = (self.slicer.is_single_stream() && slice.action() == StreamActionType::Start)
            .then(|| slice.last_event().map(|last| (&last.stream, last.version)))
            .flatten();
        if let Some((stream, tip)) = known_tip {
            if let Some(append) = appends.iter_mut().find(|append| &append.stream == stream) {
                for (offset, pending) in (1u64..).zip(append.events.iter_mut()) {
                    pending.version = Some(tip + offset);
                }
                append.expected_version = Some(tip + append.events.len() as u64);
            }
        }
        appends
    }

    async fn enqueue(
        &self,
        session: &ProjectionSession,
        operations: Vec<StorageOperation>,
        messages: Vec<OutboundMessage>,
    ) -> Result<()> {
        if !session.unit_of_work().enqueue(operations) {
            tracing::debug!("Unit of work no longer accepts operations; slice skipped");
            return Ok(());
        }
        if messages.is_empty() {
            return Ok(());
        }

        let batch = session.unit_of_work().message_batch().await?;
        for message in messages {
            batch.publish(message).await?;
        }
        Ok(())
    }
}
