//! JSONB document storage.

use crate::error::storage_error;
use foldline_core::BoxFuture;
use foldline_core::error::StorageError;
use foldline_core::event::TenantId;
use foldline_core::storage::{AggregateDocument, DocumentStorage};
use sqlx::PgPool;
use std::marker::PhantomData;

/// [`DocumentStorage`] for one document type in `foldline_documents`.
///
/// Reads go straight to the pool. Writes are produced as storage operations
/// and executed by a [`PostgresExecutor`](crate::PostgresExecutor) inside the
/// update batch's transaction.
///
/// # Example
///
/// ```ignore
/// let storage = PostgresDocumentStorage::<Bin>::new(pool.clone(), "bin");
/// let bin = storage.load(&TenantId::default(), &"bin-1".to_string()).await?;
/// ```
pub struct PostgresDocumentStorage<D> {
    pool: PgPool,
    document_type: String,
    _document: PhantomData<fn() -> D>,
}

impl<D> Clone for PostgresDocumentStorage<D> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone(), self.document_type.clone())
    }
}

impl<D> PostgresDocumentStorage<D> {
    /// Create storage for `document_type`.
    #[must_use]
    pub fn new(pool: PgPool, document_type: impl Into<String>) -> Self {
        Self {
            pool,
            document_type: document_type.into(),
            _document: PhantomData,
        }
    }
}

fn decode<D: AggregateDocument>(data: serde_json::Value) -> Result<D, StorageError> {
    serde_json::from_value(data).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl<D: AggregateDocument> DocumentStorage<D> for PostgresDocumentStorage<D> {
    fn document_type(&self) -> &str {
        &self.document_type
    }

    fn load<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        id: &'a D::Id,
    ) -> BoxFuture<'a, Result<Option<D>, StorageError>> {
        Box::pin(async move {
            let row: Option<(serde_json::Value,)> = sqlx::query_as(
                r"
                SELECT data FROM foldline_documents
                WHERE document_type = $1 AND tenant_id = $2 AND id = $3
                ",
            )
            .bind(&self.document_type)
            .bind(tenant_id.as_str())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            row.map(|(data,)| decode(data)).transpose()
        })
    }

    fn load_many<'a>(
        &'a self,
        tenant_id: &'a TenantId,
        ids: &'a [D::Id],
    ) -> BoxFuture<'a, Result<Vec<D>, StorageError>> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(Vec::new());
            }
            let keys: Vec<String> = ids.iter().map(ToString::to_string).collect();
            let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
                r"
                SELECT data FROM foldline_documents
                WHERE document_type = $1 AND tenant_id = $2 AND id = ANY($3)
                ",
            )
            .bind(&self.document_type)
            .bind(tenant_id.as_str())
            .bind(&keys)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            tracing::trace!(
                document_type = %self.document_type,
                requested = keys.len(),
                found = rows.len(),
                "Loaded documents"
            );
            rows.into_iter().map(|(data,)| decode(data)).collect()
        })
    }
}
