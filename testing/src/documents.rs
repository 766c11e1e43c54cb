//! In-memory document storage.

use crate::lock;
use foldline_core::BoxFuture;
use foldline_core::error::StorageError;
use foldline_core::event::TenantId;
use foldline_core::operation::StorageOperation;
use foldline_core::storage::{AggregateDocument, DocumentStorage};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type DocumentKey = (String, TenantId, String);

/// A stored JSON document and the stream revision it reflects.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Serialized document.
    pub data: serde_json::Value,
    /// Revision written with the document, if any.
    pub revision: Option<u64>,
}

/// Shared document table for all document types of a test.
///
/// Cloning shares the underlying table.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: Arc<Mutex<HashMap<DocumentKey, StoredDocument>>>,
}

impl InMemoryDocumentStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document, if present.
    #[must_use]
    pub fn get(&self, document_type: &str, tenant_id: &TenantId, id: &str) -> Option<StoredDocument> {
        lock(&self.documents)
            .get(&(document_type.to_string(), tenant_id.clone(), id.to_string()))
            .cloned()
    }

    /// Number of stored documents across all types and tenants.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.documents).len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `operations` all or nothing.
    ///
    /// Operations other than upserts and deletes are ignored here.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Concurrency` if an upsert carries a revision
    /// that is not newer than the stored one and violations are not ignored.
    pub fn apply<'a>(
        &self,
        operations: impl IntoIterator<Item = &'a StorageOperation>,
    ) -> Result<(), StorageError> {
        let mut documents = lock(&self.documents);
        let mut staged = documents.clone();
        for operation in operations {
            match operation {
                StorageOperation::Upsert {
                    document_type,
                    tenant_id,
                    id,
                    data,
                    revision,
                    ignore_concurrency_violation,
                } => {
                    let key = (document_type.clone(), tenant_id.clone(), id.clone());
                    if let (Some(expected), false) = (revision, ignore_concurrency_violation) {
                        let stored = staged.get(&key).and_then(|document| document.revision);
                        if stored.is_some_and(|stored| stored >= *expected) {
                            return Err(StorageError::Concurrency {
                                document_type: document_type.clone(),
                                id: id.clone(),
                                expected: *expected,
                            });
                        }
                    }
                    staged.insert(
                        key,
                        StoredDocument {
                            data: data.clone(),
                            revision: *revision,
                        },
                    );
                }
                StorageOperation::Delete {
                    document_type,
                    tenant_id,
                    id,
                } => {
                    staged.remove(&(document_type.clone(), tenant_id.clone(), id.clone()));
                }
                StorageOperation::AppendEvents(_) | StorageOperation::UpdateProgression { .. } => {}
            }
        }
        *documents = staged;
        Ok(())
    }

    /// Store `document` directly, bypassing any batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` if the document does not
    /// serialize.
    pub fn insert<D: AggregateDocument>(
        &self,
        document_type: &str,
        tenant_id: &TenantId,
        document: &D,
    ) -> Result<(), StorageError> {
        let data = serde_json::to_value(document)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        lock(&self.documents).insert(
            (
                document_type.to_string(),
                tenant_id.clone(),
                document.identity().to_string(),
            ),
            StoredDocument {
                data,
                revision: None,
            },
        );
        Ok(())
    }

    fn read<D: AggregateDocument>(
        &self,
        document_type: &str,
        tenant_id: &TenantId,
        id: &D::Id,
    ) -> Result<Option<D>, StorageError> {
        self.get(document_type, tenant_id, &id.to_string())
            .map(|stored| {
                serde_json::from_value(stored.data)
                    .map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }
}

/// [`DocumentStorage`] for one document type over an [`InMemoryDocumentStore`].
///
/// Counts reads so tests can assert on cache behavior.
pub struct InMemoryDocumentStorage<D> {
    document_type: String,
    store: InMemoryDocumentStore,
    loads: AtomicUsize,
    multi_loads: AtomicUsize,
    loaded_ids: Mutex<Vec<String>>,
    _document: PhantomData<fn() -> D>,
}

impl<D> InMemoryDocumentStorage<D> {
    /// Create a storage writing `document_type` into `store`.
    #[must_use]
    pub fn new(document_type: impl Into<String>, store: InMemoryDocumentStore) -> Self {
        Self {
            document_type: document_type.into(),
            store,
            loads: AtomicUsize::new(0),
            multi_loads: AtomicUsize::new(0),
            loaded_ids: Mutex::new(Vec::new()),
            _document: PhantomData,
        }
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &InMemoryDocumentStore {
        &self.store
    }

    /// Number of single-document loads.
    #[must_use]
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Number of multi-get round trips.
    #[must_use]
    pub fn load_many_count(&self) -> usize {
        self.multi_loads.load(Ordering::SeqCst)
    }

    /// Every identity requested so far, by either kind of load.
    #[must_use]
    pub fn loaded_ids(&self) -> Vec<String> {
        lock(&self.loaded_ids).clone()
    }
}

impl<D: AggregateDocument> InMemoryDocumentStorage<D> {
    /// Stored document for `id` in the default tenant.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Serialization` if the stored JSON does not
    /// match `D`.
    pub fn document(&self, id: &D::Id) -> Result<Option<D>, StorageError> {
        self.store
            .read(&self.document_type, &TenantId::default(), id)
    }
}

impl<D: AggregateDocument> DocumentStorage<D> for InMemoryDocumentStorage<D> {
    fn document_type(&self) -> &str {
        &self.document_type
    }

    fn load<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        id: &'a D::Id,
    ) -> BoxFuture<'a, Result<Option<D>, StorageError>> {
        Box::pin(async move {
            self.loads.fetch_add(1, Ordering::SeqCst);
            lock(&self.loaded_ids).push(id.to_string());
            self.store.read(&self.document_type, tenant_id, id)
        })
    }

    fn load_many<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        ids: &'a [D::Id],
    ) -> BoxFuture<'a, Result<Vec<D>, StorageError>> {
        Box::pin(async move {
            self.multi_loads.fetch_add(1, Ordering::SeqCst);
            lock(&self.loaded_ids).extend(ids.iter().map(ToString::to_string));
            let mut documents = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(document) = self.store.read(&self.document_type, tenant_id, id)? {
                    documents.push(document);
                }
            }
            Ok(documents)
        })
    }
}
