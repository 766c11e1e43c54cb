//! In-memory sessions, commit listeners and message outbox.

use crate::documents::InMemoryDocumentStore;
use crate::event_log::InMemoryEventLog;
use crate::lock;
use foldline_core::BoxFuture;
use foldline_core::error::StorageError;
use foldline_core::event::Event;
use foldline_core::operation::{AppendEvents, ChangeSet, OperationPage, StorageOperation};
use foldline_core::session::{
    CommitListener, MessageBatch, MessageOutbox, OutboundMessage, SessionExecutor, SessionFactory,
};
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Event-log side of page execution.
pub trait LogWriter: Send + Sync {
    /// Append side-effect events.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the append is rejected.
    fn append(&self, append: &AppendEvents) -> Result<(), StorageError>;

    /// Record a shard's progression.
    fn progress(&self, shard_name: &str, sequence: u64);
}

impl<E: Event + Clone + DeserializeOwned> LogWriter for InMemoryEventLog<E> {
    fn append(&self, append: &AppendEvents) -> Result<(), StorageError> {
        self.apply_append(append)
    }

    fn progress(&self, shard_name: &str, sequence: u64) {
        self.write_progression(shard_name, sequence);
    }
}

#[derive(Default)]
struct SessionLog {
    committed: Mutex<Vec<Vec<OperationPage>>>,
    failure: Mutex<Option<StorageError>>,
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Opens [`InMemoryExecutor`]s over a shared document store and log.
///
/// Keeps every committed batch so tests can assert on page layout and
/// operation order.
#[derive(Clone)]
pub struct InMemorySessionFactory {
    store: InMemoryDocumentStore,
    log: Option<Arc<dyn LogWriter>>,
    record: Arc<SessionLog>,
}

impl InMemorySessionFactory {
    /// Create a factory writing documents to `store`.
    #[must_use]
    pub fn new(store: InMemoryDocumentStore) -> Self {
        Self {
            store,
            log: None,
            record: Arc::new(SessionLog::default()),
        }
    }

    /// Also write appends and progressions to `log`.
    #[must_use]
    pub fn with_log(mut self, log: Arc<dyn LogWriter>) -> Self {
        self.log = Some(log);
        self
    }

    /// Fail the next execution with `error`.
    pub fn fail_next(&self, error: StorageError) {
        *lock(&self.record.failure) = Some(error);
    }

    /// Committed batches, in commit order.
    #[must_use]
    pub fn committed_batches(&self) -> Vec<Vec<OperationPage>> {
        lock(&self.record.committed).clone()
    }

    /// Every committed operation, in commit order.
    #[must_use]
    pub fn committed_operations(&self) -> Vec<StorageOperation> {
        lock(&self.record.committed)
            .iter()
            .flatten()
            .flat_map(|page| page.operations().iter().cloned())
            .collect()
    }

    /// Sessions opened so far.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.record.opened.load(Ordering::SeqCst)
    }

    /// Sessions released so far.
    #[must_use]
    pub fn released(&self) -> usize {
        self.record.released.load(Ordering::SeqCst)
    }

    /// Executor sharing this factory's store, log and record.
    #[must_use]
    pub fn executor(&self) -> Arc<InMemoryExecutor> {
        Arc::new(InMemoryExecutor {
            store: self.store.clone(),
            log: self.log.clone(),
            record: Arc::clone(&self.record),
            released: AtomicBool::new(false),
        })
    }
}

impl SessionFactory for InMemorySessionFactory {
    fn open_session(&self) -> BoxFuture<'_, Result<Arc<dyn SessionExecutor>, StorageError>> {
        Box::pin(async move {
            self.record.opened.fetch_add(1, Ordering::SeqCst);
            let executor: Arc<dyn SessionExecutor> = self.executor();
            Ok(executor)
        })
    }
}

/// Executes pages against the in-memory store.
///
/// Documents apply all or nothing; appends and progressions follow once the
/// documents succeeded.
pub struct InMemoryExecutor {
    store: InMemoryDocumentStore,
    log: Option<Arc<dyn LogWriter>>,
    record: Arc<SessionLog>,
    released: AtomicBool,
}

impl InMemoryExecutor {
    /// Whether [`release`](SessionExecutor::release) was called.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    fn execute(&self, pages: &[OperationPage]) -> Result<(), StorageError> {
        if let Some(error) = lock(&self.record.failure).take() {
            return Err(error);
        }

        self.store
            .apply(pages.iter().flat_map(OperationPage::operations))?;

        if let Some(log) = &self.log {
            for operation in pages.iter().flat_map(OperationPage::operations) {
                match operation {
                    StorageOperation::AppendEvents(append) => log.append(append)?,
                    StorageOperation::UpdateProgression {
                        shard_name,
                        sequence,
                    } => log.progress(shard_name, *sequence),
                    StorageOperation::Upsert { .. } | StorageOperation::Delete { .. } => {}
                }
            }
        }

        lock(&self.record.committed).push(pages.to_vec());
        Ok(())
    }
}

impl SessionExecutor for InMemoryExecutor {
    fn execute_pages<'a>(
        &'a self,
        pages: &'a [OperationPage],
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move { self.execute(pages) })
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.released.swap(true, Ordering::SeqCst) {
                self.record.released.fetch_add(1, Ordering::SeqCst);
            }
        })
    }
}

/// Commit listener counting its invocations.
#[derive(Default)]
pub struct RecordingListener {
    before: AtomicUsize,
    after: AtomicUsize,
    operations_seen: AtomicUsize,
    fail_before: AtomicBool,
}

impl RecordingListener {
    /// Create a listener.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `before_commit` fail, aborting the batch.
    pub fn fail_before_commit(&self) {
        self.fail_before.store(true, Ordering::SeqCst);
    }

    /// `before_commit` invocations.
    #[must_use]
    pub fn before_count(&self) -> usize {
        self.before.load(Ordering::SeqCst)
    }

    /// `after_commit` invocations.
    #[must_use]
    pub fn after_count(&self) -> usize {
        self.after.load(Ordering::SeqCst)
    }

    /// Operations in the change set of the last `after_commit`.
    #[must_use]
    pub fn operations_seen(&self) -> usize {
        self.operations_seen.load(Ordering::SeqCst)
    }
}

impl CommitListener for RecordingListener {
    fn before_commit<'a>(
        &'a self,
        _changes: ChangeSet<'a>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.before.fetch_add(1, Ordering::SeqCst);
            if self.fail_before.load(Ordering::SeqCst) {
                return Err(StorageError::Database("listener rejected commit".to_string()));
            }
            Ok(())
        })
    }

    fn after_commit<'a>(
        &'a self,
        changes: ChangeSet<'a>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.after.fetch_add(1, Ordering::SeqCst);
            self.operations_seen.store(changes.len(), Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Outbox collecting messages once their batch commits.
#[derive(Clone, Default)]
pub struct InMemoryOutbox {
    created: Arc<AtomicUsize>,
    published: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl InMemoryOutbox {
    /// Create an outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Message batches created so far.
    #[must_use]
    pub fn batches_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Messages whose batch committed, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.published).clone()
    }
}

impl MessageOutbox for InMemoryOutbox {
    fn create_batch(&self) -> BoxFuture<'_, Result<Arc<dyn MessageBatch>, StorageError>> {
        Box::pin(async move {
            self.created.fetch_add(1, Ordering::SeqCst);
            let batch: Arc<dyn MessageBatch> = Arc::new(InMemoryMessageBatch {
                pending: Mutex::new(Vec::new()),
                published: Arc::clone(&self.published),
            });
            Ok(batch)
        })
    }
}

/// Messages of one update batch, released to the outbox after commit.
pub struct InMemoryMessageBatch {
    pending: Mutex<Vec<OutboundMessage>>,
    published: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl CommitListener for InMemoryMessageBatch {
    fn after_commit<'a>(
        &'a self,
        _changes: ChangeSet<'a>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let pending = std::mem::take(&mut *lock(&self.pending));
            lock(&self.published).extend(pending);
            Ok(())
        })
    }
}

impl MessageBatch for InMemoryMessageBatch {
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), StorageError>> {
        Box::pin(async move {
            lock(&self.pending).push(message);
            Ok(())
        })
    }
}
