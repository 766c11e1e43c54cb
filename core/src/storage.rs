//! Aggregate documents and the document storage collaborator.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::event::TenantId;
use crate::identity::AggregateIdentity;
use crate::operation::StorageOperation;
use serde::{Serialize, de::DeserializeOwned};

/// A materialized aggregate persisted as a JSON document.
///
/// # Examples
///
/// ```
/// use foldline_core::storage::AggregateDocument;
/// use serde::{Deserialize, Serialize};
/// use uuid::Uuid;
///
/// #[derive(Clone, Debug, Default, Serialize, Deserialize)]
/// struct Order {
///     id: Uuid,
///     version: u64,
///     lines: u32,
/// }
///
/// impl AggregateDocument for Order {
///     type Id = Uuid;
///
///     fn identity(&self) -> Uuid {
///         self.id
///     }
///
///     fn set_identity(&mut self, id: &Uuid) {
///         self.id = *id;
///     }
///
///     fn set_version(&mut self, version: u64) {
///         self.version = version;
///     }
/// }
/// ```
pub trait AggregateDocument: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identity type.
    type Id: AggregateIdentity;

    /// Current identity of the document.
    fn identity(&self) -> Self::Id;

    /// Assign the identity. Called after every fold that leaves a document.
    fn set_identity(&mut self, id: &Self::Id);

    /// Record the stream version the document reflects.
    ///
    /// Called for single-stream aggregates only. Documents that do not track
    /// their version keep the default no-op.
    fn set_version(&mut self, _version: u64) {}
}

/// Document storage for one aggregate type.
///
/// Reads are async and hit the database; writes are not executed here but
/// returned as [`StorageOperation`]s for an update batch to order and commit.
pub trait DocumentStorage<D: AggregateDocument>: Send + Sync {
    /// Name of the document type (table) written by this storage.
    fn document_type(&self) -> &str;

    /// Load one document.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the read or deserialization fails.
    fn load<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        id: &'a D::Id,
    ) -> BoxFuture<'a, Result<Option<D>, StorageError>>;

    /// Load several documents in one round trip.
    ///
    /// Missing identities are absent from the result; order is unspecified.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the read or deserialization fails.
    fn load_many<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        ids: &'a [D::Id],
    ) -> BoxFuture<'a, Result<Vec<D>, StorageError>>;

    /// Build an upsert for `document`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` if the document cannot be
    /// rendered as JSON.
    fn upsert(
        &self,
        tenant_id: &TenantId,
        document: &D,
        revision: Option<u64>,
        ignore_concurrency_violation: bool,
    ) -> Result<StorageOperation, StorageError> {
        let data = serde_json::to_value(document)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(StorageOperation::Upsert {
            document_type: self.document_type().to_string(),
            tenant_id: tenant_id.clone(),
            id: document.identity().to_string(),
            data,
            revision,
            ignore_concurrency_violation,
        })
    }

    /// Build a delete for the document with identity `id`.
    fn delete_for_id(&self, tenant_id: &TenantId, id: &D::Id) -> StorageOperation {
        StorageOperation::Delete {
            document_type: self.document_type().to_string(),
            tenant_id: tenant_id.clone(),
            id: id.to_string(),
        }
    }
}
