//! # Foldline Testing
//!
//! In-memory collaborators and helpers for testing projections.
//!
//! This crate provides:
//! - [`InMemoryEventLog`]: sequence generator with reservable gaps, stream
//!   versions and progression rows
//! - [`InMemoryDocumentStore`] / [`InMemoryDocumentStorage`]: JSON document
//!   tables with revision checks and load counters
//! - [`InMemorySessionFactory`]: transactional page execution that records
//!   every committed batch
//! - [`RecordingListener`] and [`InMemoryOutbox`] for commit hooks
//! - Deterministic clocks and proptest strategies
//!
//! ## Example
//!
//! ```ignore
//! use foldline_testing::{InMemoryDocumentStore, InMemoryEventLog, InMemorySessionFactory};
//!
//! #[tokio::test]
//! async fn folds_new_stream() {
//!     let log = Arc::new(InMemoryEventLog::new());
//!     let store = InMemoryDocumentStore::new();
//!     let sessions = InMemorySessionFactory::new(store.clone()).with_log(log.clone());
//!
//!     log.append(StreamIdentity::key("bin-1"), BinEvent::Stocked { quantity: 4 });
//!     // build a runtime and agent over `log`, `store` and `sessions`, run a pass
//! }
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod documents;
pub mod event_log;
pub mod session;

pub use documents::{InMemoryDocumentStorage, InMemoryDocumentStore, StoredDocument};
pub use event_log::InMemoryEventLog;
pub use session::{
    InMemoryExecutor, InMemoryMessageBatch, InMemoryOutbox, InMemorySessionFactory, LogWriter,
    RecordingListener,
};

/// Lock a test double's state, ignoring poisoning from a panicking test.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mock implementations of Environment traits
pub mod mocks {
    use chrono::{DateTime, Duration, Utc};
    use foldline_core::environment::Clock;
    use std::sync::Mutex;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use foldline_testing::mocks::FixedClock;
    /// use foldline_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Lets safe-zone tests commit events "in the past" and then move the
    /// horizon past them.
    #[derive(Debug)]
    pub struct ManualClock {
        time: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        /// Create a clock reading `time`.
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Mutex::new(time),
            }
        }

        /// Move the clock forward by `by`.
        pub fn advance(&self, by: Duration) {
            *crate::lock(&self.time) += by;
        }

        /// Set the clock to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *crate::lock(&self.time) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *crate::lock(&self.time)
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a `tracing` subscriber writing to the test harness.
    ///
    /// Honors `RUST_LOG`, defaulting to `debug` for Foldline crates. Safe to
    /// call from every test; only the first call installs.
    pub fn init_tracing() {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("foldline_projections=debug,foldline_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::collection::{btree_set, vec};
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    /// A log of `1..=len` sequences with some of them missing.
    #[derive(Debug, Clone)]
    pub struct GappedLog {
        /// Highest assigned sequence.
        pub len: u64,
        /// Sequences never committed.
        pub missing: BTreeSet<u64>,
    }

    impl GappedLog {
        /// The first missing sequence minus one, or `len` without gaps.
        #[must_use]
        pub fn contiguous_mark(&self) -> u64 {
            self.missing.first().map_or(self.len, |gap| gap - 1)
        }
    }

    /// Logs of up to `max_len` sequences with up to a quarter missing.
    pub fn gapped_log(max_len: u64) -> impl Strategy<Value = GappedLog> {
        (1..=max_len.max(1)).prop_flat_map(|len| {
            let max_missing = usize::try_from(len / 4).unwrap_or(0);
            btree_set(1..=len, 0..=max_missing).prop_map(move |missing| GappedLog { len, missing })
        })
    }

    /// Producer workloads: each producer submits a list of operation
    /// counts, one entry per atomic enqueue.
    pub fn producer_workloads(
        producers: usize,
        enqueues: usize,
        max_ops: usize,
    ) -> impl Strategy<Value = Vec<Vec<usize>>> {
        vec(vec(1..=max_ops.max(1), 0..=enqueues), 1..=producers.max(1))
    }
}
