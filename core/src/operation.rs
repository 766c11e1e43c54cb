//! Storage operations, pages and change sets.
//!
//! The projection engine never talks to a database directly. It produces
//! [`StorageOperation`]s, which an update batch groups into ordered
//! [`OperationPage`]s and hands to a
//! [`SessionExecutor`](crate::session::SessionExecutor). Backends interpret
//! the operations; the engine only orders them.

use crate::event::{SerializedEvent, TenantId};
use crate::stream::StreamIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event raised as a side effect, waiting to be appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    /// Id the event will be stored under.
    pub id: Uuid,
    /// Explicit stream version, or `None` to let the log assign the next one.
    pub version: Option<u64>,
    /// Serialized payload.
    pub event: SerializedEvent,
    /// Time the event was raised.
    pub timestamp: DateTime<Utc>,
}

/// Append of side-effect events to one stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendEvents {
    /// Tenant owning the stream.
    pub tenant_id: TenantId,
    /// Target stream.
    pub stream: StreamIdentity,
    /// Stream version expected after the append, when it is known up front.
    ///
    /// `None` is a quick append: versions are taken from the stream's
    /// current tip at execution time.
    pub expected_version: Option<u64>,
    /// Events in append order.
    pub events: Vec<PendingEvent>,
}

/// A single write queued into an update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageOperation {
    /// Insert or replace a document.
    Upsert {
        /// Document type (table) name.
        document_type: String,
        /// Owning tenant.
        tenant_id: TenantId,
        /// Document identity rendered as a string.
        id: String,
        /// Serialized document.
        data: serde_json::Value,
        /// Stream version the document now reflects, for single-stream aggregates.
        revision: Option<u64>,
        /// Skip the revision check on write.
        ignore_concurrency_violation: bool,
    },

    /// Delete a document.
    Delete {
        /// Document type (table) name.
        document_type: String,
        /// Owning tenant.
        tenant_id: TenantId,
        /// Document identity rendered as a string.
        id: String,
    },

    /// Append side-effect events.
    AppendEvents(AppendEvents),

    /// Advance a shard's progression row.
    UpdateProgression {
        /// Shard (progression) name.
        shard_name: String,
        /// New confirmed sequence.
        sequence: u64,
    },
}

impl StorageOperation {
    /// Document type written by this operation, if it writes a document.
    #[must_use]
    pub fn document_type(&self) -> Option<&str> {
        match self {
            Self::Upsert { document_type, .. } | Self::Delete { document_type, .. } => {
                Some(document_type)
            }
            Self::AppendEvents(_) | Self::UpdateProgression { .. } => None,
        }
    }

    /// Document identity written by this operation, if it writes a document.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id, .. } => Some(id),
            Self::AppendEvents(_) | Self::UpdateProgression { .. } => None,
        }
    }

    /// Tenant this operation writes to. Progression updates are global.
    #[must_use]
    pub const fn tenant_id(&self) -> Option<&TenantId> {
        match self {
            Self::Upsert { tenant_id, .. } | Self::Delete { tenant_id, .. } => Some(tenant_id),
            Self::AppendEvents(append) => Some(&append.tenant_id),
            Self::UpdateProgression { .. } => None,
        }
    }

    /// Whether this is a document deletion.
    #[must_use]
    pub const fn is_delete(&self) -> bool {
        matches!(self, Self::Delete { .. })
    }

    /// Whether this is a document upsert.
    #[must_use]
    pub const fn is_upsert(&self) -> bool {
        matches!(self, Self::Upsert { .. })
    }
}

/// Ordered group of operations executed as one database round trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationPage {
    operations: Vec<StorageOperation>,
}

impl OperationPage {
    /// Create an empty page.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            operations: Vec::new(),
        }
    }

    /// Create an empty page with room for `capacity` operations.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            operations: Vec::with_capacity(capacity),
        }
    }

    /// Append an operation.
    pub fn push(&mut self, operation: StorageOperation) {
        self.operations.push(operation);
    }

    /// Number of operations in the page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Whether the page holds no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Operations in execution order.
    #[must_use]
    pub fn operations(&self) -> &[StorageOperation] {
        &self.operations
    }

    /// Consume the page, returning its operations.
    #[must_use]
    pub fn into_operations(self) -> Vec<StorageOperation> {
        self.operations
    }
}

impl From<Vec<StorageOperation>> for OperationPage {
    fn from(operations: Vec<StorageOperation>) -> Self {
        Self { operations }
    }
}

/// The full logical change set of one batch, as seen by commit listeners.
#[derive(Debug, Clone, Copy)]
pub struct ChangeSet<'a> {
    pages: &'a [OperationPage],
}

impl<'a> ChangeSet<'a> {
    /// Wrap the pages of a batch.
    #[must_use]
    pub const fn new(pages: &'a [OperationPage]) -> Self {
        Self { pages }
    }

    /// Pages in execution order.
    #[must_use]
    pub const fn pages(self) -> &'a [OperationPage] {
        self.pages
    }

    /// Every operation in execution order.
    pub fn operations(self) -> impl Iterator<Item = &'a StorageOperation> + 'a {
        self.pages.iter().flat_map(|page| page.operations().iter())
    }

    /// Total number of operations.
    #[must_use]
    pub fn len(self) -> usize {
        self.pages.iter().map(OperationPage::len).sum()
    }

    /// Whether the change set holds no operations.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Identities of the documents of `document_type` upserted by this batch.
    pub fn upserted_ids<'b>(self, document_type: &'b str) -> impl Iterator<Item = &'a str> + 'b
    where
        'a: 'b,
    {
        self.operations()
            .filter(move |op| op.is_upsert() && op.document_type() == Some(document_type))
            .filter_map(StorageOperation::document_id)
    }

    /// Identities of the documents of `document_type` deleted by this batch.
    pub fn deleted_ids<'b>(self, document_type: &'b str) -> impl Iterator<Item = &'a str> + 'b
    where
        'a: 'b,
    {
        self.operations()
            .filter(move |op| op.is_delete() && op.document_type() == Some(document_type))
            .filter_map(StorageOperation::document_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(id: &str) -> StorageOperation {
        StorageOperation::Upsert {
            document_type: "order".to_string(),
            tenant_id: TenantId::default(),
            id: id.to_string(),
            data: serde_json::json!({ "id": id }),
            revision: None,
            ignore_concurrency_violation: false,
        }
    }

    fn delete(id: &str) -> StorageOperation {
        StorageOperation::Delete {
            document_type: "order".to_string(),
            tenant_id: TenantId::default(),
            id: id.to_string(),
        }
    }

    #[test]
    fn change_set_flattens_pages_in_order() {
        let pages = vec![
            OperationPage::from(vec![upsert("a"), upsert("b")]),
            OperationPage::from(vec![delete("c")]),
        ];
        let changes = ChangeSet::new(&pages);

        let ids: Vec<_> = changes
            .operations()
            .filter_map(StorageOperation::document_id)
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes.upserted_ids("order").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(changes.deleted_ids("order").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(changes.upserted_ids("invoice").count(), 0);
    }

    #[test]
    fn progression_updates_are_tenant_free() {
        let op = StorageOperation::UpdateProgression {
            shard_name: "Orders:All".to_string(),
            sequence: 10,
        };
        assert_eq!(op.tenant_id(), None);
        assert_eq!(op.document_type(), None);
    }
}
