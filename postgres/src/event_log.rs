//! `PostgreSQL` event log and progression table.

use crate::error::{storage_error, to_bigint, to_sequence};
use chrono::{DateTime, Utc};
use foldline_core::BoxFuture;
use foldline_core::error::StorageError;
use foldline_core::event::{Event, EventRecord, TenantId};
use foldline_core::event_log::{EventLog, EventSource};
use foldline_core::progress::{EventRange, SequenceEntry, ShardProgress};
use foldline_core::stream::StreamIdentity;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use uuid::Uuid;

/// Sequence state and progression rows stored in `PostgreSQL`.
///
/// Reads `foldline_event_sequence` for the highest assigned sequence and
/// `foldline_event_progression` for shard and high-water rows.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Create an event log over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl EventLog for PostgresEventLog {
    fn highest_sequence(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async move {
            // `last_value` is the sequence's start value until first use.
            let (last_value,): (i64,) =
                sqlx::query_as("SELECT last_value FROM foldline_event_sequence")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| storage_error(&e))?;
            to_sequence(last_value)
        })
    }

    fn scan_sequences(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<SequenceEntry>, StorageError>> {
        Box::pin(async move {
            #[allow(clippy::cast_possible_wrap)] // Page sizes are small
            let limit = limit as i64;
            let rows: Vec<(i64, DateTime<Utc>)> = sqlx::query_as(
                r"
                SELECT seq_id, timestamp
                FROM foldline_events
                WHERE seq_id > $1 AND seq_id <= $2
                ORDER BY seq_id
                LIMIT $3
                ",
            )
            .bind(to_bigint(after)?)
            .bind(to_bigint(up_to)?)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            rows.into_iter()
                .map(|(sequence, timestamp)| {
                    Ok(SequenceEntry {
                        sequence: to_sequence(sequence)?,
                        timestamp,
                    })
                })
                .collect()
        })
    }

    fn load_progression<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ShardProgress>, StorageError>> {
        Box::pin(async move {
            let row: Option<(i64, DateTime<Utc>)> = sqlx::query_as(
                "SELECT last_seq_id, last_updated FROM foldline_event_progression WHERE name = $1",
            )
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            row.map(|(sequence, last_updated)| {
                Ok(ShardProgress {
                    sequence: to_sequence(sequence)?,
                    last_updated,
                })
            })
            .transpose()
        })
    }

    fn save_progression<'a>(
        &'a self,
        name: &'a str,
        sequence: u64,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            sqlx::query(UPSERT_PROGRESSION)
                .bind(name)
                .bind(to_bigint(sequence)?)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            Ok(())
        })
    }

    fn advance_progression<'a>(
        &'a self,
        name: &'a str,
        expected: u64,
        sequence: u64,
    ) -> BoxFuture<'a, Result<bool, StorageError>> {
        Box::pin(async move {
            let result = sqlx::query(ADVANCE_PROGRESSION)
                .bind(name)
                .bind(to_bigint(expected)?)
                .bind(to_bigint(sequence)?)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            Ok(result.rows_affected() == 1)
        })
    }
}

/// Inserts only when the caller expects no row; updates only a row still
/// holding the expected value.
const ADVANCE_PROGRESSION: &str = r"
    INSERT INTO foldline_event_progression (name, last_seq_id, last_updated)
    SELECT $1, $3, now()
    WHERE $2 = 0
    ON CONFLICT (name) DO UPDATE
    SET last_seq_id = EXCLUDED.last_seq_id, last_updated = now()
    WHERE foldline_event_progression.last_seq_id = $2
";

pub(crate) const UPSERT_PROGRESSION: &str = r"
    INSERT INTO foldline_event_progression (name, last_seq_id, last_updated)
    VALUES ($1, $2, now())
    ON CONFLICT (name) DO UPDATE
    SET last_seq_id = EXCLUDED.last_seq_id, last_updated = now()
";

/// Typed event records read from `foldline_events`.
///
/// Payloads are decoded with [`Event::from_bytes`].
pub struct PostgresEventSource<E> {
    pool: PgPool,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for PostgresEventSource<E> {
    fn clone(&self) -> Self {
        Self::new(self.pool.clone())
    }
}

impl<E> PostgresEventSource<E> {
    /// Create an event source over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _event: PhantomData,
        }
    }
}

impl<E: Event + DeserializeOwned> PostgresEventSource<E> {
    fn decode(row: &PgRow) -> Result<EventRecord<E>, StorageError> {
        let bytes: Vec<u8> = row.get("data");
        let data = E::from_bytes(&bytes).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let stream: String = row.get("stream_id");
        let stream = stream
            .parse::<StreamIdentity>()
            .map_err(|e| StorageError::Serialization(format!("stream '{stream}': {e}")))?;
        let sequence: i64 = row.get("seq_id");
        let version: i64 = row.get("version");
        let tenant_id: String = row.get("tenant_id");
        let id: Uuid = row.get("id");

        Ok(EventRecord::new(to_sequence(sequence)?, stream, to_sequence(version)?, data)
            .with_id(id)
            .with_tenant(TenantId::new(tenant_id))
            .with_timestamp(row.get("timestamp")))
    }
}

impl<E: Event + DeserializeOwned> EventSource<E> for PostgresEventSource<E> {
    fn fetch_range<'a>(
        &'a self,
        range: &'a EventRange,
        event_types: &'a [&'static str],
    ) -> BoxFuture<'a, Result<Vec<EventRecord<E>>, StorageError>> {
        Box::pin(async move {
            let types: Vec<&str> = event_types.to_vec();
            let rows = sqlx::query(
                r"
                SELECT seq_id, id, tenant_id, stream_id, version, data, timestamp
                FROM foldline_events
                WHERE seq_id > $1 AND seq_id <= $2
                  AND (cardinality($3::text[]) = 0 OR event_type = ANY($3))
                ORDER BY seq_id
                ",
            )
            .bind(to_bigint(range.floor)?)
            .bind(to_bigint(range.ceiling)?)
            .bind(&types)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            tracing::debug!(range = %range, events = rows.len(), "Fetched event range");
            rows.iter().map(Self::decode).collect()
        })
    }
}
