//! Session collaborators: page execution, commit hooks and the message outbox.

use crate::BoxFuture;
use crate::error::{ProjectionError, StorageError};
use crate::operation::{ChangeSet, OperationPage, StorageOperation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Transactional executor owned by one update batch.
pub trait SessionExecutor: Send + Sync {
    /// Execute `pages` in order inside one transaction.
    ///
    /// Each page is one round trip. Either every page commits or none does.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if any operation fails; the transaction is
    /// rolled back.
    fn execute_pages<'a>(
        &'a self,
        pages: &'a [OperationPage],
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Release the underlying connection. Called at most once per batch.
    fn release(&self) -> BoxFuture<'_, ()>;
}

/// Opens a fresh executor for each update batch.
pub trait SessionFactory: Send + Sync {
    /// Open a session (connection plus transaction scope).
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if no connection can be acquired.
    fn open_session(&self) -> BoxFuture<'_, Result<Arc<dyn SessionExecutor>, StorageError>>;
}

/// Hook invoked around the execution of a batch.
pub trait CommitListener: Send + Sync {
    /// Called once before the pages execute.
    ///
    /// # Errors
    ///
    /// An error aborts the batch before anything is written.
    fn before_commit<'a>(
        &'a self,
        _changes: ChangeSet<'a>,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async { Ok(()) })
    }

    /// Called once after the pages committed.
    ///
    /// # Errors
    ///
    /// The batch is already durable; the error is reported to the caller.
    fn after_commit<'a>(&'a self, changes: ChangeSet<'a>)
    -> BoxFuture<'a, Result<(), StorageError>>;
}

/// Message published as a side effect of folding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Routing type of the message.
    pub message_type: String,
    /// JSON body.
    pub body: serde_json::Value,
}

impl OutboundMessage {
    /// Create a message.
    #[must_use]
    pub fn new(message_type: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            message_type: message_type.into(),
            body,
        }
    }
}

/// Outbound messages collected for one update batch.
///
/// Registered as a commit listener of that batch so messages go out only
/// once the batch commits.
pub trait MessageBatch: CommitListener {
    /// Queue `message` for publication.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the message cannot be queued.
    fn publish(&self, message: OutboundMessage) -> BoxFuture<'_, Result<(), StorageError>>;
}

/// Factory for message batches.
pub trait MessageOutbox: Send + Sync {
    /// Create a batch for a new update batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the outbox cannot allocate a batch.
    fn create_batch(&self) -> BoxFuture<'_, Result<Arc<dyn MessageBatch>, StorageError>>;
}

/// Destination for the operations produced while folding.
///
/// Implemented by the async update batch and by the inline unit of work that
/// shares the caller's transaction.
pub trait UnitOfWork: Send + Sync {
    /// Queue `operations` as one atomic unit.
    ///
    /// Returns `false` when the unit of work no longer accepts operations
    /// (cancelled or completed); nothing was queued in that case.
    fn enqueue(&self, operations: Vec<StorageOperation>) -> bool;

    /// The message batch owned by this unit of work, created on first use.
    ///
    /// # Errors
    ///
    /// Returns `ProjectionError::Configuration` if no outbox is configured,
    /// or the outbox's error if batch creation fails.
    fn message_batch(&self) -> BoxFuture<'_, Result<Arc<dyn MessageBatch>, ProjectionError>>;
}
