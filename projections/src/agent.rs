//! `ShardAgent`: the loop driving one async projection or subscription.
//!
//! # Overview
//!
//! One agent runs per registered shard. What a pass feeds its events into is
//! a [`ShardProcessor`]: an [`AggregationRuntime`] for projections, or a
//! [`SubscriptionShard`] wrapping a
//! [`Subscription`](foldline_core::subscription::Subscription). Each pass:
//! 1. loads the shard's progression (last confirmed sequence)
//! 2. detects the high-water mark and persists it
//! 3. fetches the next range `(progression, min(mark, progression + batch)]`
//! 4. hands the events to the processor, which queues its operations into
//!    an update batch
//! 5. queues the progression update in the same batch and executes it
//!
//! Documents and progression commit in one transaction, so a crash between
//! passes replays at most the uncommitted range.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   mark    ┌──────────────────┐
//! │ EventLog │──────────▶│ HighWaterDetector│
//! └────┬─────┘           └────────┬─────────┘
//!      │ range                    │
//!      ▼                          ▼
//! ┌─────────────┐  slices  ┌────────────────────┐  ops  ┌───────────────────────┐
//! │ EventSource │─────────▶│ AggregationRuntime │──────▶│ ProjectionUpdateBatch │
//! └─────────────┘          └────────────────────┘       └───────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! let (agent, shutdown) = ShardAgent::new("Order:All", runtime, collaborators, settings);
//! let handle = tokio::spawn(async move { agent.run().await });
//!
//! tokio::signal::ctrl_c().await.ok();
//! shutdown.send(true).ok();
//! handle.await?;
//! ```

use crate::batch::{BatchOptions, ProjectionUpdateBatch};
use crate::high_water::HighWaterDetector;
use crate::runtime::AggregationRuntime;
use crate::session::ProjectionSession;
use foldline_core::BoxFuture;
use foldline_core::aggregate::{Aggregator, ShardExecutionMode};
use foldline_core::cancellation::CancellationSignal;
use foldline_core::config::DaemonSettings;
use foldline_core::environment::Clock;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::{Event, EventRecord, TenantId};
use foldline_core::event_log::{EventLog, EventSource};
use foldline_core::operation::StorageOperation;
use foldline_core::progress::EventRange;
use foldline_core::session::{CommitListener, MessageOutbox, SessionFactory, UnitOfWork};
use foldline_core::subscription::Subscription;
use std::sync::Arc;
use tokio::sync::watch;

/// What a shard pass hands its fetched events to.
pub trait ShardProcessor<E>: Send + Sync {
    /// Event types fetched for the shard. Empty means every type.
    fn event_types(&self) -> &[&'static str];

    /// Process the events of `range`, queueing operations through
    /// `session`'s unit of work.
    ///
    /// # Errors
    ///
    /// Any error fails the pass before anything commits.
    fn process<'a>(
        &'a self,
        session: &'a ProjectionSession,
        range: &'a EventRange,
        events: &'a [Arc<EventRecord<E>>],
        cancel: &'a CancellationSignal,
    ) -> BoxFuture<'a, Result<()>>;

    /// Drop in-memory state that may be ahead of the committed progression.
    fn reset(&self) {}
}

impl<A: Aggregator> ShardProcessor<A::Event> for AggregationRuntime<A> {
    fn event_types(&self) -> &[&'static str] {
        self.aggregator().event_types()
    }

    fn process<'a>(
        &'a self,
        session: &'a ProjectionSession,
        _range: &'a EventRange,
        events: &'a [Arc<EventRecord<A::Event>>],
        cancel: &'a CancellationSignal,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for group in self.slice(events)? {
                self.process_group(session, group, cancel).await?;
            }
            Ok(())
        })
    }

    fn reset(&self) {
        self.clear_caches();
    }
}

/// Runs a [`Subscription`] as a shard: no slicing, no aggregation.
pub struct SubscriptionShard<S> {
    subscription: Arc<S>,
}

impl<S> SubscriptionShard<S> {
    /// Wrap `subscription`.
    #[must_use]
    pub const fn new(subscription: Arc<S>) -> Self {
        Self { subscription }
    }
}

impl<E, S> ShardProcessor<E> for SubscriptionShard<S>
where
    S: Subscription<E>,
{
    fn event_types(&self) -> &[&'static str] {
        self.subscription.event_types()
    }

    fn process<'a>(
        &'a self,
        session: &'a ProjectionSession,
        range: &'a EventRange,
        events: &'a [Arc<EventRecord<E>>],
        cancel: &'a CancellationSignal,
    ) -> BoxFuture<'a, Result<()>> {
        self.subscription
            .process_events(range, events, session.unit_of_work(), cancel)
    }
}

/// Collaborators a shard agent reads from and writes through.
pub struct ShardCollaborators<E> {
    /// Sequence state and progression rows.
    pub log: Arc<dyn EventLog>,
    /// Full event records.
    pub source: Arc<dyn EventSource<E>>,
    /// Opens one transactional executor per pass.
    pub sessions: Arc<dyn SessionFactory>,
    /// Clock for safe-zone horizons.
    pub clock: Arc<dyn Clock>,
    /// Shard-level commit listeners.
    pub listeners: Vec<Arc<dyn CommitListener>>,
    /// Outbox for messages raised as side effects.
    pub outbox: Option<Arc<dyn MessageOutbox>>,
}

impl<E> Clone for ShardCollaborators<E> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            source: Arc::clone(&self.source),
            sessions: Arc::clone(&self.sessions),
            clock: Arc::clone(&self.clock),
            listeners: self.listeners.clone(),
            outbox: self.outbox.clone(),
        }
    }
}

/// Drives one shard through repeated passes.
///
/// # Type Parameters
///
/// - `E`: The event type read from the log
pub struct ShardAgent<E> {
    name: String,
    processor: Arc<dyn ShardProcessor<E>>,
    detector: HighWaterDetector,
    collaborators: ShardCollaborators<E>,
    settings: DaemonSettings,
    shutdown: watch::Receiver<bool>,
}

impl<E: Event> ShardAgent<E> {
    /// Create an agent for the shard `name`, usually an
    /// [`AggregationRuntime`].
    ///
    /// Returns the agent and a shutdown sender. Send `true` to stop the
    /// agent; the pass in flight is cancelled and its batch discarded.
    #[must_use]
    pub fn new<P>(
        name: impl Into<String>,
        processor: Arc<P>,
        collaborators: ShardCollaborators<E>,
        settings: DaemonSettings,
    ) -> (Self, watch::Sender<bool>)
    where
        P: ShardProcessor<E> + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let detector = HighWaterDetector::new(
            Arc::clone(&collaborators.log),
            Arc::clone(&collaborators.clock),
            &settings,
        );

        let agent = Self {
            name: name.into(),
            processor,
            detector,
            collaborators,
            settings,
            shutdown: shutdown_rx,
        };

        (agent, shutdown_tx)
    }

    /// Create an agent running `subscription` as the shard `name`.
    #[must_use]
    pub fn subscription<S>(
        name: impl Into<String>,
        subscription: Arc<S>,
        collaborators: ShardCollaborators<E>,
        settings: DaemonSettings,
    ) -> (Self, watch::Sender<bool>)
    where
        S: Subscription<E>,
    {
        let shard = Arc::new(SubscriptionShard::new(subscription));
        Self::new(name, shard, collaborators, settings)
    }

    /// Shard (progression) name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one pass.
    ///
    /// Returns the range committed, or `None` when nothing new is safe to
    /// consume. A cancelled pass closes its batch without executing it.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Cancelled`] if `cancel` fired
    /// - [`ProjectionError::Storage`] for collaborator failures
    /// - processing failures, such as slicing or folding errors
    #[tracing::instrument(skip_all, name = "shard.run_pass", fields(shard = %self.name, mode = ?mode))]
    pub async fn run_pass(
        &self,
        mode: ShardExecutionMode,
        cancel: &CancellationSignal,
    ) -> Result<Option<EventRange>> {
        let floor = self
            .collaborators
            .log
            .load_progression(&self.name)
            .await?
            .map_or(0, |progress| progress.sequence);

        let statistics = match mode {
            ShardExecutionMode::Continuous => self.detector.detect_in_safe_zone(cancel).await?,
            ShardExecutionMode::Rebuild => self.detector.detect(cancel).await?,
        };
        self.detector.mark(&statistics).await?;

        if statistics.current_mark <= floor {
            tracing::trace!(floor, mark = statistics.current_mark, "Nothing new to consume");
            return Ok(None);
        }

        let ceiling = statistics
            .current_mark
            .min(floor.saturating_add(self.settings.shard_batch_size));
        let range = EventRange::new(self.name.clone(), floor, ceiling);

        let events: Vec<Arc<EventRecord<E>>> = self
            .collaborators
            .source
            .fetch_range(&range, self.processor.event_types())
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

        let executor = self.collaborators.sessions.open_session().await?;
        let batch = ProjectionUpdateBatch::start(
            self.batch_options(mode, &range),
            executor,
            cancel.clone(),
        );

        let outcome = self.fill_and_execute(&batch, mode, &range, &events, cancel).await;
        batch.close().await;

        if let Err(e) = outcome {
            // Folded state may be cached without having been committed.
            self.processor.reset();
            return Err(e);
        }

        tracing::info!(
            shard = %self.name,
            range = %range,
            events = events.len(),
            "Shard pass committed"
        );
        Ok(Some(range))
    }

    fn batch_options(&self, mode: ShardExecutionMode, range: &EventRange) -> BatchOptions {
        let mut options = BatchOptions::default()
            .with_update_batch_size(self.settings.update_batch_size)
            .with_mode(mode)
            .with_range(range.clone());
        for listener in &self.collaborators.listeners {
            options = options.with_listener(Arc::clone(listener));
        }
        if let Some(outbox) = &self.collaborators.outbox {
            options = options.with_outbox(Arc::clone(outbox));
        }
        options
    }

    async fn fill_and_execute(
        &self,
        batch: &Arc<ProjectionUpdateBatch>,
        mode: ShardExecutionMode,
        range: &EventRange,
        events: &[Arc<EventRecord<E>>],
        cancel: &CancellationSignal,
    ) -> Result<()> {
        let unit_of_work: Arc<dyn UnitOfWork> = Arc::clone(batch) as Arc<dyn UnitOfWork>;
        let session = ProjectionSession::new(TenantId::default(), mode, unit_of_work);

        self.processor
            .process(&session, range, events, cancel)
            .await?;

        let progressed = batch.enqueue(vec![StorageOperation::UpdateProgression {
            shard_name: self.name.clone(),
            sequence: range.ceiling,
        }]);
        if !progressed || cancel.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }

        batch.execute().await
    }

    /// Run continuous passes until shutdown.
    ///
    /// A pass that found nothing new, or failed, is followed by the fetching
    /// cooldown. Failures are logged and retried; they never stop the loop.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        let cancel = CancellationSignal::new();
        tracing::info!(shard = %self.name, "Starting shard agent");

        while !*shutdown.borrow() {
            let pass = self.run_pass(ShardExecutionMode::Continuous, &cancel);
            tokio::pin!(pass);

            let outcome = tokio::select! {
                outcome = &mut pass => outcome,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        cancel.cancel();
                    }
                    pass.await
                }
            };

            let idle = match outcome {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(ProjectionError::Cancelled) => break,
                Err(e) => {
                    tracing::error!(
                        shard = %self.name,
                        error = %e,
                        transient = e.is_transient(),
                        "Shard pass failed"
                    );
                    true
                }
            };

            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.settings.fetching_cooldown()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        tracing::info!(shard = %self.name, "Shard agent stopped");
    }

    /// Rebuild the projection from the start of the log.
    ///
    /// Resets the shard's progression to zero, resets the processor, then runs
    /// rebuild passes until the high-water mark is reached. Side effects are
    /// not raised and commit listeners do not run during a rebuild.
    ///
    /// # Errors
    ///
    /// Returns the first pass failure, or [`ProjectionError::Cancelled`].
    #[tracing::instrument(skip_all, name = "shard.rebuild", fields(shard = %self.name))]
    pub async fn rebuild(&self, cancel: &CancellationSignal) -> Result<()> {
        tracing::info!(shard = %self.name, "Rebuilding projection");

        self.collaborators.log.save_progression(&self.name, 0).await?;
        self.processor.reset();

        let mut passes = 0_u64;
        while let Some(range) = self.run_pass(ShardExecutionMode::Rebuild, cancel).await? {
            passes += 1;
            tracing::debug!(range = %range, "Rebuild pass committed");
        }

        tracing::info!(shard = %self.name, passes, "Projection rebuilt");
        Ok(())
    }
}
