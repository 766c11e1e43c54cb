//! Error taxonomy for the projection engine.
//!
//! Two layers:
//!
//! - [`StorageError`] is what collaborators (log, document storage, session
//!   executor) report. The engine never wraps these; they surface unchanged
//!   through [`ProjectionError::Storage`] so an orchestration layer can retry
//!   transient failures differently from permanent ones.
//! - [`ProjectionError`] is what the engine reports. Failures raised by user
//!   fold code are wrapped with the offending event's identity.

use crate::event::{Event, EventRecord};
use crate::stream::StreamIdentity;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error returned by user aggregation code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by storage collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// A retryable database failure (lost connection, serialization failure).
    #[error("Transient database error: {0}")]
    Transient(String),

    /// A non-retryable database failure.
    #[error("Database error: {0}")]
    Database(String),

    /// A document or event payload could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Optimistic concurrency check failed on write.
    #[error("Concurrency conflict on {document_type} '{id}': expected revision {expected}")]
    Concurrency {
        /// Document type being written.
        document_type: String,
        /// Document identity.
        id: String,
        /// Revision the writer expected to replace.
        expected: u64,
    },

    /// Another writer holds the stream row during a fetch-for-write.
    #[error("Stream '{stream}' is locked by another writer")]
    StreamLocked {
        /// Locked stream.
        stream: String,
    },
}

impl StorageError {
    /// Whether an orchestration layer may retry the failed operation as-is.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::StreamLocked { .. })
    }
}

/// Errors reported by the projection engine.
#[derive(Error, Debug)]
pub enum ProjectionError {
    /// A collaborator failed. Passed through unwrapped.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// User fold code failed while applying an event.
    #[error("Failed to apply event {event_type} (id {event_id}, sequence {sequence}, stream {stream}): {source}")]
    ApplyEvent {
        /// Id of the event being applied.
        event_id: Uuid,
        /// Global sequence of the event.
        sequence: u64,
        /// Stream the event belongs to.
        stream: StreamIdentity,
        /// Type tag of the event.
        event_type: String,
        /// Failure raised by the fold code.
        source: BoxError,
    },

    /// The projection is misconfigured. Fatal at setup, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The operation observed the cancellation signal before producing a value.
    #[error("Operation cancelled")]
    Cancelled,

    /// An update batch was used in a state that does not permit the call.
    #[error("Invalid batch state: {0}")]
    BatchState(String),
}

impl ProjectionError {
    /// Classify a failure raised by user code while folding `event`.
    ///
    /// A [`StorageError`] (for example from fold code that performs its own
    /// I/O) passes through; anything else is wrapped with the event's identity.
    #[must_use]
    pub fn from_fold_failure<E: Event>(event: &EventRecord<E>, error: BoxError) -> Self {
        match error.downcast::<StorageError>() {
            Ok(storage) => Self::Storage(*storage),
            Err(source) => Self::ApplyEvent {
                event_id: event.id,
                sequence: event.sequence,
                stream: event.stream.clone(),
                event_type: event.event_type().to_string(),
                source,
            },
        }
    }

    /// Whether this error is a collaborator failure that may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Storage(storage) => storage.is_transient(),
            _ => false,
        }
    }
}

/// Result type for projection engine operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
