//! Mapping of `sqlx` failures onto [`StorageError`].

use foldline_core::error::StorageError;

/// `lock_not_available`, raised by `FOR UPDATE NOWAIT`.
pub(crate) const LOCK_NOT_AVAILABLE: &str = "55P03";
/// `serialization_failure`.
const SERIALIZATION_FAILURE: &str = "40001";
/// `deadlock_detected`.
const DEADLOCK_DETECTED: &str = "40P01";

/// Classify a `sqlx` error.
///
/// Connection-level failures, serialization failures and deadlocks are
/// transient; everything else is a database error.
pub(crate) fn storage_error(error: &sqlx::Error) -> StorageError {
    let transient = match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | LOCK_NOT_AVAILABLE)
        ),
        _ => false,
    };

    if transient {
        metrics::counter!("postgres_transient_errors_total").increment(1);
        StorageError::Transient(error.to_string())
    } else {
        StorageError::Database(error.to_string())
    }
}

/// Whether `error` is a failed `NOWAIT` lock.
pub(crate) fn is_lock_not_available(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE))
}

/// Convert a sequence read from a `BIGINT` column.
pub(crate) fn to_sequence(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Database(format!("negative sequence {value} in database")))
}

/// Convert a sequence for a `BIGINT` parameter.
pub(crate) fn to_bigint(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value)
        .map_err(|_| StorageError::Database(format!("sequence {value} exceeds BIGINT range")))
}
