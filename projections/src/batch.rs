//! Ordered, paged commit of projection operations.
//!
//! # Overview
//!
//! Slices are folded concurrently, but the operations they produce must be
//! written in a deterministic order. [`ProjectionUpdateBatch`] accepts
//! operations through an unbounded `mpsc` channel drained by exactly one
//! task, so the committed order is the enqueue order regardless of which
//! fold finished first.
//!
//! The draining task fills [`OperationPage`]s up to the configured size. When
//! the batch is executed, all pages run in creation order inside one
//! transaction, surrounded by the commit listeners.
//!
//! # Lifecycle
//!
//! ```text
//! Building ──(ready / cancel)──▶ Draining ──▶ Ready ──▶ Executing ──▶ Committed
//!                                                            └──────▶ RolledBack
//! ```

use crate::metrics::BatchMetrics;
use foldline_core::BoxFuture;
use foldline_core::aggregate::ShardExecutionMode;
use foldline_core::cancellation::CancellationSignal;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::operation::{ChangeSet, OperationPage, StorageOperation};
use foldline_core::progress::EventRange;
use foldline_core::session::{
    CommitListener, MessageBatch, MessageOutbox, SessionExecutor, UnitOfWork,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::{OnceCell, mpsc};
use tokio::task::JoinHandle;

/// Lifecycle state of an update batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchState {
    /// Accepting operations.
    Building,
    /// No longer accepting; queued operations are being paged.
    Draining,
    /// Pages are complete and ready to execute.
    Ready,
    /// Pages are being executed.
    Executing,
    /// All pages committed.
    Committed,
    /// Execution failed; nothing was committed.
    RolledBack,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Building => "building",
            Self::Draining => "draining",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Options of one update batch.
#[derive(Clone)]
pub struct BatchOptions {
    /// Maximum operations per page.
    pub update_batch_size: usize,
    /// Execution mode of the shard owning the batch.
    pub mode: ShardExecutionMode,
    /// Whether commit listeners run. Defaults to continuous mode only.
    pub should_apply_listeners: bool,
    /// Range the batch covers, for diagnostics.
    pub range: Option<EventRange>,
    /// Shard-level commit listeners.
    pub listeners: Vec<Arc<dyn CommitListener>>,
    /// Outbox used to create the batch's message batch on first use.
    pub outbox: Option<Arc<dyn MessageOutbox>>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            update_batch_size: 500,
            mode: ShardExecutionMode::Continuous,
            should_apply_listeners: true,
            range: None,
            listeners: Vec::new(),
            outbox: None,
        }
    }
}

impl BatchOptions {
    /// Set the page size.
    #[must_use]
    pub const fn with_update_batch_size(mut self, size: usize) -> Self {
        self.update_batch_size = size;
        self
    }

    /// Set the execution mode. Listeners apply only in continuous mode
    /// unless overridden afterwards.
    #[must_use]
    pub fn with_mode(mut self, mode: ShardExecutionMode) -> Self {
        self.mode = mode;
        self.should_apply_listeners = mode == ShardExecutionMode::Continuous;
        self
    }

    /// Force commit listeners on or off.
    #[must_use]
    pub const fn with_should_apply_listeners(mut self, apply: bool) -> Self {
        self.should_apply_listeners = apply;
        self
    }

    /// Record the range the batch covers.
    #[must_use]
    pub fn with_range(mut self, range: EventRange) -> Self {
        self.range = Some(range);
        self
    }

    /// Add a shard-level commit listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn CommitListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Set the message outbox.
    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<dyn MessageOutbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }
}

/// Ordered, paged sink of storage operations for one shard pass.
pub struct ProjectionUpdateBatch {
    mode: ShardExecutionMode,
    should_apply_listeners: bool,
    range: Option<EventRange>,
    listeners: Vec<Arc<dyn CommitListener>>,
    batch_listeners: Mutex<Vec<Arc<dyn CommitListener>>>,
    outbox: Option<Arc<dyn MessageOutbox>>,
    message_batch: OnceCell<Arc<dyn MessageBatch>>,
    executor: Arc<dyn SessionExecutor>,
    cancel: CancellationSignal,
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<StorageOperation>>>>,
    builder: tokio::sync::Mutex<Option<JoinHandle<Vec<OperationPage>>>>,
    pages: Mutex<Vec<OperationPage>>,
    state: Mutex<BatchState>,
    closed: AtomicBool,
}

impl ProjectionUpdateBatch {
    /// Start a batch. Spawns the task that drains the sink into pages, so
    /// this must be called within a Tokio runtime.
    #[must_use]
    pub fn start(
        options: BatchOptions,
        executor: Arc<dyn SessionExecutor>,
        cancel: CancellationSignal,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let page_size = options.update_batch_size.max(1);
        let builder = tokio::spawn(build_pages(receiver, page_size, cancel.clone()));

        Arc::new(Self {
            mode: options.mode,
            should_apply_listeners: options.should_apply_listeners,
            range: options.range,
            listeners: options.listeners,
            batch_listeners: Mutex::new(Vec::new()),
            outbox: options.outbox,
            message_batch: OnceCell::new(),
            executor,
            cancel,
            sender: Mutex::new(Some(sender)),
            builder: tokio::sync::Mutex::new(Some(builder)),
            pages: Mutex::new(Vec::new()),
            state: Mutex::new(BatchState::Building),
            closed: AtomicBool::new(false),
        })
    }

    /// Execution mode of the owning shard.
    #[must_use]
    pub const fn mode(&self) -> ShardExecutionMode {
        self.mode
    }

    /// Range covered by this batch, if known.
    #[must_use]
    pub const fn range(&self) -> Option<&EventRange> {
        self.range.as_ref()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> BatchState {
        *lock(&self.state)
    }

    fn transition(&self, from: &[BatchState], to: BatchState) -> Result<()> {
        let mut state = lock(&self.state);
        if !from.contains(&state) {
            return Err(ProjectionError::BatchState(format!(
                "cannot move from {} to {to}",
                *state
            )));
        }
        *state = to;
        Ok(())
    }

    /// Queue `operations` as one atomic unit.
    ///
    /// Returns `false` (queuing nothing) once the batch is cancelled or no
    /// longer building.
    pub fn enqueue(&self, operations: Vec<StorageOperation>) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if operations.is_empty() {
            return true;
        }
        lock(&self.sender)
            .as_ref()
            .is_some_and(|sender| sender.send(operations).is_ok())
    }

    /// Register a commit listener for this batch only.
    pub fn add_listener(&self, listener: Arc<dyn CommitListener>) {
        lock(&self.batch_listeners).push(listener);
    }

    /// The batch's message batch, created through the outbox on first use.
    ///
    /// Concurrent first calls create it exactly once. It is notified of the
    /// commit like any other listener.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Configuration`] if no outbox is configured
    /// - [`ProjectionError::Storage`] if the outbox fails to create a batch
    pub async fn current_message_batch(&self) -> Result<Arc<dyn MessageBatch>> {
        let outbox = self.outbox.as_ref().ok_or_else(|| {
            ProjectionError::Configuration("no message outbox is configured".to_string())
        })?;
        self.message_batch
            .get_or_try_init(|| async { outbox.create_batch().await.map_err(ProjectionError::from) })
            .await
            .cloned()
    }

    /// Stop accepting operations and wait until every queued operation is
    /// paged.
    ///
    /// Idempotent once the batch is ready.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::BatchState`] if the batch already executed
    /// or the paging task failed.
    pub async fn ready(&self) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match *state {
                BatchState::Building => *state = BatchState::Draining,
                BatchState::Draining => {}
                BatchState::Ready => return Ok(()),
                other => {
                    return Err(ProjectionError::BatchState(format!(
                        "cannot complete a batch that is {other}"
                    )));
                }
            }
        }

        // Dropping the sender lets the paging task finish once it has
        // drained everything already queued.
        lock(&self.sender).take();

        let handle = self.builder.lock().await.take();
        if let Some(handle) = handle {
            let pages = handle.await.map_err(|e| {
                ProjectionError::BatchState(format!("page builder failed: {e}"))
            })?;
            *lock(&self.pages) = pages;
        }

        self.transition(&[BatchState::Draining], BatchState::Ready)?;
        tracing::debug!(
            pages = lock(&self.pages).len(),
            range = ?self.range,
            "Update batch ready"
        );
        Ok(())
    }

    /// Snapshot of the built pages.
    #[must_use]
    pub fn pages(&self) -> Vec<OperationPage> {
        lock(&self.pages).clone()
    }

    /// Complete the batch if needed, then execute all pages in one
    /// transaction, running commit listeners around it.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::BatchState`] if the batch already executed
    /// - [`ProjectionError::Storage`] if a listener or the executor fails;
    ///   a failure before the commit rolls the batch back
    #[tracing::instrument(skip_all, name = "update_batch.execute", fields(range = ?self.range))]
    pub async fn execute(&self) -> Result<()> {
        self.ready().await?;
        self.transition(&[BatchState::Ready], BatchState::Executing)?;

        let pages = std::mem::take(&mut *lock(&self.pages));
        let started = Instant::now();
        let outcome = self.commit(&pages).await;
        let operation_count: usize = pages.iter().map(OperationPage::len).sum();
        let page_count = pages.len();
        *lock(&self.pages) = pages;

        match outcome {
            Ok(()) => {
                self.transition(&[BatchState::Executing], BatchState::Committed)?;
                BatchMetrics::record_commit(page_count, started.elapsed());
                tracing::info!(
                    pages = page_count,
                    operations = operation_count,
                    range = ?self.range,
                    "Update batch committed"
                );
                self.notify_after_commit().await
            }
            Err(e) => {
                self.transition(&[BatchState::Executing], BatchState::RolledBack)?;
                BatchMetrics::record_rollback();
                tracing::error!(error = %e, range = ?self.range, "Update batch rolled back");
                Err(e)
            }
        }
    }

    fn listeners_apply(&self) -> bool {
        self.should_apply_listeners
            && (!self.listeners.is_empty()
                || !lock(&self.batch_listeners).is_empty()
                || self.message_batch.initialized())
    }

    async fn commit(&self, pages: &[OperationPage]) -> Result<()> {
        if self.listeners_apply() {
            let changes = ChangeSet::new(pages);
            for listener in self.all_listeners() {
                listener.before_commit(changes).await?;
            }
            if let Some(messages) = self.message_batch.get() {
                messages.before_commit(changes).await?;
            }
        }

        if !pages.is_empty() {
            self.executor.execute_pages(pages).await?;
        }
        Ok(())
    }

    async fn notify_after_commit(&self) -> Result<()> {
        if !self.listeners_apply() {
            return Ok(());
        }

        let pages = std::mem::take(&mut *lock(&self.pages));
        let changes = ChangeSet::new(&pages);
        let mut outcome = Ok(());
        for listener in self.all_listeners() {
            if let Err(e) = listener.after_commit(changes).await {
                tracing::error!(error = %e, "Commit listener failed after commit");
                outcome = outcome.and(Err(e.into()));
            }
        }
        if let Some(messages) = self.message_batch.get() {
            if let Err(e) = messages.after_commit(changes).await {
                tracing::error!(error = %e, "Message batch failed after commit");
                outcome = outcome.and(Err(e.into()));
            }
        }
        *lock(&self.pages) = pages;
        outcome
    }

    fn all_listeners(&self) -> Vec<Arc<dyn CommitListener>> {
        let mut listeners = self.listeners.clone();
        listeners.extend(lock(&self.batch_listeners).iter().cloned());
        listeners
    }

    /// Stop accepting operations and release the executor.
    ///
    /// Safe to call more than once; only the first call releases.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.sender).take();
        self.executor.release().await;
        tracing::debug!(range = ?self.range, state = %self.state(), "Update batch closed");
    }
}

impl UnitOfWork for ProjectionUpdateBatch {
    fn enqueue(&self, operations: Vec<StorageOperation>) -> bool {
        Self::enqueue(self, operations)
    }

    fn message_batch(&self) -> BoxFuture<'_, Result<Arc<dyn MessageBatch>>> {
        Box::pin(self.current_message_batch())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Upper bound on the capacity reserved for a fresh page.
const PAGE_CAPACITY_HINT: usize = 64;

/// Drain `receiver` into pages of at most `page_size` operations.
///
/// Each received vector is one slice's operations and is paged as a whole,
/// so cancellation can only take effect between slices.
async fn build_pages(
    mut receiver: mpsc::UnboundedReceiver<Vec<StorageOperation>>,
    page_size: usize,
    cancel: CancellationSignal,
) -> Vec<OperationPage> {
    let capacity = page_size.min(PAGE_CAPACITY_HINT);
    let mut pages = vec![OperationPage::with_capacity(capacity)];

    loop {
        let operations = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::debug!("Update batch cancelled; no further pages");
                break;
            }
            received = receiver.recv() => match received {
                Some(operations) => operations,
                None => break,
            },
        };

        for operation in operations {
            if pages.last().is_none_or(|page| page.len() >= page_size) {
                pages.push(OperationPage::with_capacity(capacity));
            }
            if let Some(page) = pages.last_mut() {
                page.push(operation);
            }
        }
    }

    pages.retain(|page| !page.is_empty());
    pages
}
