//! Projection sessions.
//!
//! A [`ProjectionSession`] is what the aggregation runtime folds against: a
//! tenant, an execution mode and the [`UnitOfWork`] receiving the resulting
//! operations. Async shards use a
//! [`ProjectionUpdateBatch`](crate::batch::ProjectionUpdateBatch) as unit of
//! work; inline projections use an [`InlineUnitOfWork`] bound to the
//! caller's transaction.

use foldline_core::BoxFuture;
use foldline_core::aggregate::ShardExecutionMode;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event::TenantId;
use foldline_core::operation::StorageOperation;
use foldline_core::session::{MessageBatch, MessageOutbox, UnitOfWork};
use foldline_core::storage::AggregateDocument;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;

/// Documents already loaded by a session, keyed by type and identity.
///
/// Inline projections applied several times within one transaction read
/// through the map so that each application sees the previous one's result.
#[derive(Default)]
pub struct IdentityMap {
    documents: Mutex<HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>>,
}

impl IdentityMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracked state for `id`: `None` if untracked, `Some(None)` if tracked
    /// as absent.
    #[must_use]
    pub fn get<D: AggregateDocument>(&self, id: &D::Id) -> Option<Option<D>> {
        self.documents()
            .get(&(TypeId::of::<D>(), id.to_string()))
            .and_then(|tracked| tracked.downcast_ref::<Option<D>>())
            .cloned()
    }

    /// Track `document` (or its absence) under `id`.
    pub fn store<D: AggregateDocument>(&self, id: &D::Id, document: Option<D>) {
        self.documents()
            .insert((TypeId::of::<D>(), id.to_string()), Box::new(document));
    }

    /// Stop tracking `id`.
    pub fn evict<D: AggregateDocument>(&self, id: &D::Id) {
        self.documents().remove(&(TypeId::of::<D>(), id.to_string()));
    }
}

/// Context a slice is folded in.
#[derive(Clone)]
pub struct ProjectionSession {
    tenant_id: TenantId,
    mode: ShardExecutionMode,
    unit_of_work: Arc<dyn UnitOfWork>,
    identity_map: Option<Arc<IdentityMap>>,
}

impl ProjectionSession {
    /// Create a session writing to `unit_of_work`.
    #[must_use]
    pub fn new(
        tenant_id: TenantId,
        mode: ShardExecutionMode,
        unit_of_work: Arc<dyn UnitOfWork>,
    ) -> Self {
        Self {
            tenant_id,
            mode,
            unit_of_work,
            identity_map: None,
        }
    }

    /// Read and track documents through `identity_map`.
    #[must_use]
    pub fn with_identity_map(mut self, identity_map: Arc<IdentityMap>) -> Self {
        self.identity_map = Some(identity_map);
        self
    }

    /// The same session for another tenant, sharing unit of work and
    /// identity map.
    #[must_use]
    pub fn for_tenant(&self, tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            ..self.clone()
        }
    }

    /// Tenant being folded.
    #[must_use]
    pub const fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Execution mode.
    #[must_use]
    pub const fn mode(&self) -> ShardExecutionMode {
        self.mode
    }

    /// Destination of the produced operations.
    #[must_use]
    pub fn unit_of_work(&self) -> &Arc<dyn UnitOfWork> {
        &self.unit_of_work
    }

    /// Identity map, when enabled.
    #[must_use]
    pub fn identity_map(&self) -> Option<&IdentityMap> {
        self.identity_map.as_deref()
    }
}

/// Unit of work for inline projections.
///
/// Operations are collected in order and handed back to the caller, which
/// executes them in the transaction that appended the events.
pub struct InlineUnitOfWork {
    operations: Mutex<Vec<StorageOperation>>,
    outbox: Option<Arc<dyn MessageOutbox>>,
    message_batch: OnceCell<Arc<dyn MessageBatch>>,
    completed: AtomicBool,
}

impl InlineUnitOfWork {
    /// Create an empty unit of work.
    #[must_use]
    pub fn new(outbox: Option<Arc<dyn MessageOutbox>>) -> Self {
        Self {
            operations: Mutex::new(Vec::new()),
            outbox,
            message_batch: OnceCell::new(),
            completed: AtomicBool::new(false),
        }
    }

    fn operations_guard(&self) -> MutexGuard<'_, Vec<StorageOperation>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting operations and return everything queued, in order.
    pub fn complete(&self) -> Vec<StorageOperation> {
        self.completed.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.operations_guard())
    }

    /// Number of queued operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.operations_guard().len()
    }

    /// Whether nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The message batch, if one was created.
    #[must_use]
    pub fn created_message_batch(&self) -> Option<Arc<dyn MessageBatch>> {
        self.message_batch.get().cloned()
    }
}

impl UnitOfWork for InlineUnitOfWork {
    fn enqueue(&self, operations: Vec<StorageOperation>) -> bool {
        let mut queued = self.operations_guard();
        if self.completed.load(Ordering::SeqCst) {
            return false;
        }
        queued.extend(operations);
        true
    }

    fn message_batch(&self) -> BoxFuture<'_, Result<Arc<dyn MessageBatch>>> {
        Box::pin(async move {
            let outbox = self.outbox.as_ref().ok_or_else(|| {
                ProjectionError::Configuration("no message outbox is configured".to_string())
            })?;
            self.message_batch
                .get_or_try_init(|| async { outbox.create_batch().await.map_err(ProjectionError::from) })
                .await
                .cloned()
        })
    }
}
