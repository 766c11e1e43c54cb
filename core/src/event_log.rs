//! Event log collaborators.
//!
//! The engine reads the log in two ways: [`EventLog`] exposes the sequence
//! generator, a lightweight sequence scan for high-water detection and the
//! durable progression table; [`EventSource`] fetches full event records for
//! a range.

use crate::BoxFuture;
use crate::error::StorageError;
use crate::event::EventRecord;
use crate::progress::{EventRange, SequenceEntry, ShardProgress};

/// Sequence state and progression storage of an event log.
pub trait EventLog: Send + Sync {
    /// Highest sequence the generator has assigned.
    ///
    /// A log that never assigned a sequence reports `1`, the generator's
    /// initial value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the generator cannot be read.
    fn highest_sequence(&self) -> BoxFuture<'_, Result<u64, StorageError>>;

    /// Committed sequences in `(after, up_to]`, ascending, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the scan fails.
    fn scan_sequences(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<SequenceEntry>, StorageError>>;

    /// Read a progression row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the read fails.
    fn load_progression<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ShardProgress>, StorageError>>;

    /// Insert or update a progression row outside of any batch.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    fn save_progression<'a>(
        &'a self,
        name: &'a str,
        sequence: u64,
    ) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Move a progression row from `expected` to `sequence` only if nobody
    /// else moved it first. A missing row counts as `0`.
    ///
    /// Returns `false`, leaving the row untouched, when the stored value is
    /// not `expected`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the write fails.
    fn advance_progression<'a>(
        &'a self,
        name: &'a str,
        expected: u64,
        sequence: u64,
    ) -> BoxFuture<'a, Result<bool, StorageError>>;
}

/// Source of full event records.
pub trait EventSource<E>: Send + Sync {
    /// Fetch the events in `range`, ascending by sequence.
    ///
    /// When `event_types` is non-empty only events of those types are
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the read or payload decoding fails.
    fn fetch_range<'a>(
        &'a self,
        range: &'a EventRange,
        event_types: &'a [&'static str],
    ) -> BoxFuture<'a, Result<Vec<EventRecord<E>>, StorageError>>;
}
