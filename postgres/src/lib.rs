//! `PostgreSQL` backend for Foldline.
//!
//! Implements the engine's storage collaborators on top of sqlx:
//!
//! - [`PostgresEventLog`]: sequence state, gap scanning and progression rows
//! - [`PostgresEventSource`]: typed event ranges, filtered by event type
//! - [`PostgresDocumentStorage`]: JSONB aggregate documents
//! - [`PostgresSessionFactory`]: one pinned connection and transaction per
//!   update batch, one statement per operation
//!
//! Events are appended with their sequence taken from a database sequence.
//! A transaction that takes a sequence value and rolls back leaves a gap,
//! which the high-water detector waits out before projecting past it.
//!
//! # Example
//!
//! ```ignore
//! use foldline_postgres::PostgresStore;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresStore::connect("postgres://localhost/warehouse").await?;
//!     store.migrate().await?;
//!
//!     let log = store.event_log();
//!     let sessions = store.sessions();
//!     let bins = store.documents::<Bin>("bin");
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod documents;
mod error;
mod event_log;
mod session;

pub use documents::PostgresDocumentStorage;
pub use event_log::{PostgresEventLog, PostgresEventSource};
pub use session::{PostgresExecutor, PostgresSessionFactory, append_events};

use foldline_core::error::StorageError;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Default maximum number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Entry point owning the connection pool.
///
/// Hands out the collaborators the projection engine needs, all sharing one
/// pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect with [`DEFAULT_MAX_CONNECTIONS`] pooled connections.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the database is unreachable.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        Self::connect_with(database_url, DEFAULT_MAX_CONNECTIONS).await
    }

    /// Connect with an explicit pool size.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the database is unreachable.
    pub async fn connect_with(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| error::storage_error(&e))?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the Foldline tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Database` if a migration fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Database(format!("Migration failed: {e}")))?;
        tracing::info!("Foldline schema is up to date");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Event log over this store.
    #[must_use]
    pub fn event_log(&self) -> PostgresEventLog {
        PostgresEventLog::new(self.pool.clone())
    }

    /// Typed event source over this store.
    #[must_use]
    pub fn event_source<E>(&self) -> PostgresEventSource<E> {
        PostgresEventSource::new(self.pool.clone())
    }

    /// Document storage for `document_type`.
    #[must_use]
    pub fn documents<D>(&self, document_type: impl Into<String>) -> PostgresDocumentStorage<D> {
        PostgresDocumentStorage::new(self.pool.clone(), document_type)
    }

    /// Session factory over this store.
    #[must_use]
    pub fn sessions(&self) -> PostgresSessionFactory {
        PostgresSessionFactory::new(self.pool.clone())
    }
}
