//! In-memory event log.
//!
//! Reproduces the parts of a real log the projection engine depends on:
//! a shared sequence generator whose numbers can be reserved without ever
//! being committed (leaving gaps), per-stream versions and the progression
//! table.

use crate::lock;
use chrono::{DateTime, Utc};
use foldline_core::BoxFuture;
use foldline_core::environment::{Clock, SystemClock};
use foldline_core::error::StorageError;
use foldline_core::event::{Event, EventRecord, TenantId};
use foldline_core::event_log::{EventLog, EventSource};
use foldline_core::operation::AppendEvents;
use foldline_core::progress::{EventRange, SequenceEntry, ShardProgress};
use foldline_core::stream::StreamIdentity;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

struct LogState<E> {
    events: BTreeMap<u64, EventRecord<E>>,
    last_assigned: u64,
    stream_versions: HashMap<(TenantId, StreamIdentity), u64>,
    progressions: HashMap<String, ShardProgress>,
}

impl<E> LogState<E> {
    fn next_version(&mut self, tenant_id: &TenantId, stream: &StreamIdentity) -> u64 {
        let version = self
            .stream_versions
            .entry((tenant_id.clone(), stream.clone()))
            .or_insert(0);
        *version += 1;
        *version
    }
}

/// In-memory event log for tests.
///
/// # Example
///
/// ```
/// use foldline_core::stream::StreamIdentity;
/// use foldline_testing::InMemoryEventLog;
///
/// let log = InMemoryEventLog::new();
/// log.append(StreamIdentity::key("a"), "first");
/// let reserved = log.reserve_sequences(1);
/// log.append(StreamIdentity::key("a"), "third");
///
/// assert_eq!(reserved, vec![2]);
/// assert_eq!(log.committed_sequences(), vec![1, 3]);
/// ```
pub struct InMemoryEventLog<E> {
    state: Mutex<LogState<E>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
}

impl<E: Clone> InMemoryEventLog<E> {
    /// Create an empty log timestamping events with the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty log timestamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LogState {
                events: BTreeMap::new(),
                last_assigned: 0,
                stream_versions: HashMap::new(),
                progressions: HashMap::new(),
            }),
            clock,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Commit `data` to `stream` for the default tenant.
    pub fn append(&self, stream: StreamIdentity, data: E) -> EventRecord<E> {
        self.append_for_tenant(TenantId::default(), stream, data)
    }

    /// Commit `data` to `stream` for `tenant_id`.
    pub fn append_for_tenant(
        &self,
        tenant_id: TenantId,
        stream: StreamIdentity,
        data: E,
    ) -> EventRecord<E> {
        let timestamp = self.clock.now();
        self.append_at(tenant_id, stream, data, timestamp)
    }

    /// Commit `data` with an explicit commit timestamp.
    pub fn append_at(
        &self,
        tenant_id: TenantId,
        stream: StreamIdentity,
        data: E,
        timestamp: DateTime<Utc>,
    ) -> EventRecord<E> {
        let mut state = lock(&self.state);
        state.last_assigned += 1;
        let sequence = state.last_assigned;
        Self::commit(&mut state, sequence, tenant_id, stream, data, timestamp)
    }

    /// Take `count` sequence numbers without committing events, as an
    /// in-flight or rolled-back transaction would.
    pub fn reserve_sequences(&self, count: u64) -> Vec<u64> {
        let mut state = lock(&self.state);
        let first = state.last_assigned + 1;
        state.last_assigned += count;
        (first..=state.last_assigned).collect()
    }

    /// Commit `data` under a previously reserved `sequence`, filling its gap.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Database` if the sequence was never assigned
    /// or already holds an event.
    pub fn commit_reserved(
        &self,
        sequence: u64,
        tenant_id: TenantId,
        stream: StreamIdentity,
        data: E,
    ) -> Result<EventRecord<E>, StorageError> {
        let timestamp = self.clock.now();
        let mut state = lock(&self.state);
        if sequence > state.last_assigned || state.events.contains_key(&sequence) {
            return Err(StorageError::Database(format!(
                "sequence {sequence} is not reserved"
            )));
        }
        Ok(Self::commit(&mut state, sequence, tenant_id, stream, data, timestamp))
    }

    fn commit(
        state: &mut LogState<E>,
        sequence: u64,
        tenant_id: TenantId,
        stream: StreamIdentity,
        data: E,
        timestamp: DateTime<Utc>,
    ) -> EventRecord<E> {
        let version = state.next_version(&tenant_id, &stream);
        let record = EventRecord::new(sequence, stream, version, data)
            .with_tenant(tenant_id)
            .with_timestamp(timestamp);
        state.events.insert(sequence, record.clone());
        record
    }

    /// Remove a committed event, leaving a permanent gap.
    pub fn delete_sequence(&self, sequence: u64) -> Option<EventRecord<E>> {
        lock(&self.state).events.remove(&sequence)
    }

    /// All committed events, ascending by sequence.
    #[must_use]
    pub fn events(&self) -> Vec<EventRecord<E>> {
        lock(&self.state).events.values().cloned().collect()
    }

    /// Committed sequence numbers, ascending.
    #[must_use]
    pub fn committed_sequences(&self) -> Vec<u64> {
        lock(&self.state).events.keys().copied().collect()
    }

    /// Current version of `stream` for the default tenant.
    #[must_use]
    pub fn stream_version(&self, stream: &StreamIdentity) -> u64 {
        lock(&self.state)
            .stream_versions
            .get(&(TenantId::default(), stream.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Last sequence confirmed for `name`.
    #[must_use]
    pub fn progression(&self, name: &str) -> Option<u64> {
        lock(&self.state)
            .progressions
            .get(name)
            .map(|progress| progress.sequence)
    }

    /// Make every read fail with a transient error until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("event log unavailable".to_string()));
        }
        Ok(())
    }

    /// Record a progression inside an executing batch.
    pub(crate) fn write_progression(&self, name: &str, sequence: u64) {
        let last_updated = self.clock.now();
        lock(&self.state).progressions.insert(
            name.to_string(),
            ShardProgress {
                sequence,
                last_updated,
            },
        );
    }
}

impl<E: Event + Clone + DeserializeOwned> InMemoryEventLog<E> {
    /// Append side-effect events, honoring explicit versions.
    ///
    /// # Errors
    ///
    /// - `StorageError::Concurrency` if the stream is not at the expected
    ///   version
    /// - `StorageError::Serialization` if a payload does not decode
    pub fn apply_append(&self, append: &AppendEvents) -> Result<(), StorageError> {
        let decoded = append
            .events
            .iter()
            .map(|pending| {
                E::from_bytes(&pending.event.data)
                    .map(|data| (pending, data))
                    .map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = lock(&self.state);
        let key = (append.tenant_id.clone(), append.stream.clone());
        let tip = state.stream_versions.get(&key).copied().unwrap_or(0);
        if let Some(expected) = append.expected_version {
            if tip + append.events.len() as u64 != expected {
                return Err(StorageError::Concurrency {
                    document_type: "stream".to_string(),
                    id: append.stream.to_string(),
                    expected,
                });
            }
        }

        for (pending, data) in decoded {
            state.last_assigned += 1;
            let sequence = state.last_assigned;
            let version = state.next_version(&append.tenant_id, &append.stream);
            let mut record = EventRecord::new(sequence, append.stream.clone(), version, data)
                .with_tenant(append.tenant_id.clone())
                .with_timestamp(pending.timestamp)
                .with_id(pending.id);
            if let Some(explicit) = pending.version {
                record.version = explicit;
            }
            state.events.insert(sequence, record);
        }
        Ok(())
    }
}

impl<E: Clone> Default for InMemoryEventLog<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + Sync> EventLog for InMemoryEventLog<E> {
    fn highest_sequence(&self) -> BoxFuture<'_, Result<u64, StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(lock(&self.state).last_assigned.max(1))
        })
    }

    fn scan_sequences(
        &self,
        after: u64,
        up_to: u64,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<SequenceEntry>, StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            if after >= up_to {
                return Ok(Vec::new());
            }
            Ok(lock(&self.state)
                .events
                .range(after + 1..=up_to)
                .take(limit)
                .map(|(&sequence, record)| SequenceEntry {
                    sequence,
                    timestamp: record.timestamp,
                })
                .collect())
        })
    }

    fn load_progression<'a>(
        &'a self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<Option<ShardProgress>, StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(lock(&self.state).progressions.get(name).copied())
        })
    }

    fn save_progression<'a>(
        &'a self,
        name: &'a str,
        sequence: u64,
    ) -> BoxFuture<'a, Result<(), StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            self.write_progression(name, sequence);
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
            self.check_available()?;
            let last_updated = self.clock.now();
            let mut state = lock(&self.state);
            let stored = state.progressions.get(name).map_or(0, |p| p.sequence);
            if stored != expected {
                return Ok(false);
            }
            state.progressions.insert(
                name.to_string(),
                ShardProgress {
                    sequence,
                    last_updated,
                },
            );
            Ok(true)
        })
    }
}

impl<E: Event + Clone> EventSource<E> for InMemoryEventLog<E> {
    fn fetch_range<'a>(
        &'a self,
        range: &'a EventRange,
        event_types: &'a [&'static str],
    ) -> BoxFuture<'a, Result<Vec<EventRecord<E>>, StorageError>> {
        Box::pin(async move {
            self.check_available()?;
            if range.is_empty() {
                return Ok(Vec::new());
            }
            Ok(lock(&self.state)
                .events
                .range(range.floor + 1..=range.ceiling)
                .map(|(_, record)| record)
                .filter(|record| {
                    event_types.is_empty() || event_types.contains(&record.data.event_type())
                })
                .cloned()
                .collect())
        })
    }
}
