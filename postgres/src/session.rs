//! Transactional page executor.
//!
//! Each update batch opens one [`PostgresExecutor`], which pins a pooled
//! connection for the batch's lifetime. [`execute_pages`] runs every page
//! inside a single transaction; operations inside a page run in order on
//! the same connection.
//!
//! Pages are the unit of atomicity and ordering here, not of network
//! traffic: each operation is its own statement, so a page costs one round
//! trip per operation. Upserts need their own `rows_affected` to detect a
//! stale revision, and appends lock their stream row before inserting, so
//! neither folds into a multi-row statement. Keep `update_batch_size`
//! modest when the database is far away.
//!
//! [`execute_pages`]: SessionExecutor::execute_pages

use crate::error::{is_lock_not_available, storage_error, to_bigint, to_sequence};
use crate::event_log::UPSERT_PROGRESSION;
use foldline_core::BoxFuture;
use foldline_core::error::StorageError;
use foldline_core::operation::{AppendEvents, OperationPage, StorageOperation};
use foldline_core::session::{SessionExecutor, SessionFactory};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Opens a [`PostgresExecutor`] per update batch.
#[derive(Clone)]
pub struct PostgresSessionFactory {
    pool: PgPool,
}

impl PostgresSessionFactory {
    /// Create a factory over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SessionFactory for PostgresSessionFactory {
    fn open_session(&self) -> BoxFuture<'_, Result<Arc<dyn SessionExecutor>, StorageError>> {
        Box::pin(async move {
            let connection = self.pool.acquire().await.map_err(|e| storage_error(&e))?;
            let executor: Arc<dyn SessionExecutor> = Arc::new(PostgresExecutor {
                connection: Mutex::new(Some(connection)),
            });
            Ok(executor)
        })
    }
}

/// Executes operation pages on one pinned connection.
pub struct PostgresExecutor {
    connection: Mutex<Option<PoolConnection<Postgres>>>,
}

impl SessionExecutor for PostgresExecutor {
    fn execute_pages<'a>(
        &'a self,
        pages: &'a [OperationPage],
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            let mut guard = self.connection.lock().await;
            let Some(connection) = guard.as_mut() else {
                return Err(StorageError::Database(
                    "session connection already released".to_string(),
                ));
            };

            let mut tx = sqlx::Connection::begin(&mut **connection)
                .await
                .map_err(|e| storage_error(&e))?;

            for (index, page) in pages.iter().enumerate() {
                for operation in page.operations() {
                    // Dropping `tx` on error rolls the transaction back.
                    execute(&mut tx, operation).await?;
                }
                tracing::trace!(page = index, operations = page.len(), "Executed page");
            }

            tx.commit().await.map_err(|e| storage_error(&e))?;
            tracing::debug!(pages = pages.len(), "Committed update batch");
            Ok(())
        })
    }

    fn release(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.connection.lock().await.take().is_some() {
                tracing::trace!("Released session connection");
            }
        })
    }
}

async fn execute(conn: &mut PgConnection, operation: &StorageOperation) -> Result<(), StorageError> {
    match operation {
        StorageOperation::Upsert {
            document_type,
            tenant_id,
            id,
            data,
            revision,
            ignore_concurrency_violation,
        } => {
            let bound_revision = revision.map(to_bigint).transpose()?;
            let result = sqlx::query(
                r"
                INSERT INTO foldline_documents
                    (document_type, tenant_id, id, data, revision, last_modified)
                VALUES ($1, $2, $3, $4, $5, now())
                ON CONFLICT (document_type, tenant_id, id) DO UPDATE
                SET data = EXCLUDED.data,
                    revision = EXCLUDED.revision,
                    last_modified = now()
                WHERE $6
                   OR EXCLUDED.revision IS NULL
                   OR foldline_documents.revision IS NULL
                   OR foldline_documents.revision < EXCLUDED.revision
                ",
            )
            .bind(document_type)
            .bind(tenant_id.as_str())
            .bind(id)
            .bind(data)
            .bind(bound_revision)
            .bind(*ignore_concurrency_violation)
            .execute(&mut *conn)
            .await
            .map_err(|e| storage_error(&e))?;

            if result.rows_affected() == 0 {
                return Err(StorageError::Concurrency {
                    document_type: document_type.clone(),
                    id: id.clone(),
                    expected: revision.unwrap_or_default(),
                });
            }
            Ok(())
        }
        StorageOperation::Delete {
            document_type,
            tenant_id,
            id,
        } => {
            sqlx::query(
                "DELETE FROM foldline_documents WHERE document_type = $1 AND tenant_id = $2 AND id = $3",
            )
            .bind(document_type)
            .bind(tenant_id.as_str())
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|e| storage_error(&e))?;
            Ok(())
        }
        StorageOperation::AppendEvents(append) => append_on(conn, append).await,
        StorageOperation::UpdateProgression {
            shard_name,
            sequence,
        } => {
            sqlx::query(UPSERT_PROGRESSION)
                .bind(shard_name)
                .bind(to_bigint(*sequence)?)
                .execute(&mut *conn)
                .await
                .map_err(|e| storage_error(&e))?;
            Ok(())
        }
    }
}

/// Append events to one stream in its own transaction.
///
/// Used to seed streams outside of projection batches.
///
/// # Errors
///
/// - `StorageError::Concurrency` if the stream is not at the expected version
/// - `StorageError::StreamLocked` if another writer holds the stream row
/// - `StorageError::Database` / `StorageError::Transient` on query failure
pub async fn append_events(pool: &PgPool, append: &AppendEvents) -> Result<(), StorageError> {
    let mut tx = pool.begin().await.map_err(|e| storage_error(&e))?;
    append_on(&mut tx, append).await?;
    tx.commit().await.map_err(|e| storage_error(&e))
}

async fn append_on(conn: &mut PgConnection, append: &AppendEvents) -> Result<(), StorageError> {
    let stream = append.stream.to_string();
    let tenant = append.tenant_id.as_str();

    sqlx::query(
        r"
        INSERT INTO foldline_streams (tenant_id, id, version)
        VALUES ($1, $2, 0)
        ON CONFLICT (tenant_id, id) DO NOTHING
        ",
    )
    .bind(tenant)
    .bind(&stream)
    .execute(&mut *conn)
    .await
    .map_err(|e| storage_error(&e))?;

    let (tip,): (i64,) = sqlx::query_as(
        "SELECT version FROM foldline_streams WHERE tenant_id = $1 AND id = $2 FOR UPDATE NOWAIT",
    )
    .bind(tenant)
    .bind(&stream)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| {
        if is_lock_not_available(&e) {
            StorageError::StreamLocked {
                stream: stream.clone(),
            }
        } else {
            storage_error(&e)
        }
    })?;
    let tip = to_sequence(tip)?;
    let count = append.events.len() as u64;

    if let Some(expected) = append.expected_version {
        if tip + count != expected {
            return Err(StorageError::Concurrency {
                document_type: "stream".to_string(),
                id: stream,
                expected,
            });
        }
    }

    for (offset, pending) in (1..).zip(&append.events) {
        let version = pending.version.unwrap_or(tip + offset);
        sqlx::query(
            r"
            INSERT INTO foldline_events
                (id, tenant_id, stream_id, version, event_type, data, metadata, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(pending.id)
        .bind(tenant)
        .bind(&stream)
        .bind(to_bigint(version)?)
        .bind(&pending.event.event_type)
        .bind(&pending.event.data)
        .bind(&pending.event.metadata)
        .bind(pending.timestamp)
        .execute(&mut *conn)
        .await
        .map_err(|e| storage_error(&e))?;
    }

    sqlx::query(
        "UPDATE foldline_streams SET version = $3, updated_at = now() WHERE tenant_id = $1 AND id = $2",
    )
    .bind(tenant)
    .bind(&stream)
    .bind(to_bigint(tip + count)?)
    .execute(&mut *conn)
    .await
    .map_err(|e| storage_error(&e))?;

    tracing::debug!(
        tenant = tenant,
        stream = %stream,
        events = count,
        "Appended events"
    );
    Ok(())
}
