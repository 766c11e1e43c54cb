//! Integration tests for high-water detection
//!
//! Logs are built with the in-memory event log; gaps are sequences reserved
//! by a transaction that never committed.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

mod common;

use chrono::Duration as ChronoDuration;
use common::{BinEvent, opened};
use foldline_core::cancellation::CancellationSignal;
use foldline_core::config::DaemonSettings;
use foldline_core::environment::Clock;
use foldline_core::error::{ProjectionError, StorageError};
use foldline_core::event::TenantId;
use foldline_core::event_log::EventLog;
use foldline_core::progress::HIGH_WATER_MARK;
use foldline_core::stream::StreamIdentity;
use foldline_projections::HighWaterDetector;
use foldline_testing::InMemoryEventLog;
use foldline_testing::mocks::{ManualClock, test_epoch};
use foldline_testing::properties::{GappedLog, gapped_log};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    clock: Arc<ManualClock>,
    log: Arc<InMemoryEventLog<BinEvent>>,
}

impl Fixture {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(test_epoch()));
        let log = Arc::new(InMemoryEventLog::with_clock(
            Arc::clone(&clock) as Arc<dyn Clock>
        ));
        Self { clock, log }
    }

    fn detector(&self, settings: &DaemonSettings) -> HighWaterDetector {
        HighWaterDetector::new(
            Arc::clone(&self.log) as Arc<dyn EventLog>,
            Arc::clone(&self.clock) as Arc<dyn Clock>,
            settings,
        )
    }

    fn append(&self, count: usize) {
        for _ in 0..count {
            self.log.append(StreamIdentity::key("bin-1"), opened("sku-1"));
        }
    }

    /// Build `gapped` into the log: missing sequences are reserved, the rest
    /// committed.
    fn fill(&self, gapped: &GappedLog) {
        for sequence in 1..=gapped.len {
            if gapped.missing.contains(&sequence) {
                self.log.reserve_sequences(1);
            } else {
                self.append(1);
            }
        }
    }
}

fn settings() -> DaemonSettings {
    DaemonSettings::default()
        .with_safe_zone(Duration::from_secs(5))
        .with_scan_page_size(3)
}

// ============================================================================
// Detect
// ============================================================================

/// An empty log reports the generator's initial state
#[tokio::test]
async fn test_empty_log() {
    let fixture = Fixture::new();
    let detector = fixture.detector(&settings());

    let stats = detector.detect(&CancellationSignal::new()).await.unwrap();

    assert_eq!(stats.current_mark, 0);
    assert_eq!(stats.last_mark, 0);
    assert_eq!(stats.highest_sequence, 1);
    assert_eq!(stats.last_updated, None);
}

/// A gap-free log of N events is consumable up to N
#[tokio::test]
async fn test_gap_free_log_reaches_highest_sequence() {
    let fixture = Fixture::new();
    fixture.append(10);
    let detector = fixture.detector(&settings());

    let stats = detector.detect(&CancellationSignal::new()).await.unwrap();

    assert_eq!(stats.current_mark, 10);
    assert_eq!(stats.highest_sequence, 10);
    assert!(stats.has_changed());
}

/// Permanent gaps stop detection at the first one, on every call
#[tokio::test]
async fn test_permanent_gaps_are_stable() {
    let fixture = Fixture::new();
    // Missing: 4, 7, 8
    fixture.append(3);
    fixture.log.reserve_sequences(1);
    fixture.append(2);
    fixture.log.reserve_sequences(2);
    fixture.append(2);
    let detector = fixture.detector(&settings());
    let cancel = CancellationSignal::new();

    let first = detector.detect(&cancel).await.unwrap();
    assert_eq!(first.current_mark, 3);
    assert_eq!(first.highest_sequence, 10);

    detector.mark(&first).await.unwrap();
    let second = detector.detect(&cancel).await.unwrap();
    let third = detector.detect(&cancel).await.unwrap();

    assert_eq!(second.current_mark, 3);
    assert_eq!(second.last_mark, 3);
    assert!(second.last_updated.is_some());
    assert_eq!(third.current_mark, 3);
    assert!(!third.has_changed());
}

/// Filling a gap lets detection advance to the next one
#[tokio::test]
async fn test_filled_gap_advances_mark() {
    let fixture = Fixture::new();
    fixture.append(2);
    let reserved = fixture.log.reserve_sequences(1);
    fixture.append(2);
    fixture.log.reserve_sequences(1);
    fixture.append(1);
    let detector = fixture.detector(&settings());
    let cancel = CancellationSignal::new();

    let before = detector.detect(&cancel).await.unwrap();
    detector.mark(&before).await.unwrap();
    assert_eq!(before.current_mark, 2);

    fixture
        .log
        .commit_reserved(
            reserved[0],
            TenantId::default(),
            StreamIdentity::key("bin-2"),
            opened("sku-2"),
        )
        .unwrap();
    let after = detector.detect(&cancel).await.unwrap();

    assert_eq!(after.last_mark, 2);
    assert_eq!(after.current_mark, 5);
}

/// A deleted event leaves a gap just like a rolled-back one
#[tokio::test]
async fn test_deleted_event_is_a_gap() {
    let fixture = Fixture::new();
    fixture.append(6);
    fixture.log.delete_sequence(5);
    let detector = fixture.detector(&settings());

    let stats = detector.detect(&CancellationSignal::new()).await.unwrap();
    assert_eq!(stats.current_mark, 4);
    assert_eq!(stats.highest_sequence, 6);
}

/// A generator behind the persisted mark means the log was reset
#[tokio::test]
async fn test_reset_log_clamps_mark_to_highest_sequence() {
    let fixture = Fixture::new();
    fixture.append(5);
    fixture.log.save_progression(HIGH_WATER_MARK, 40).await.unwrap();
    let detector = fixture.detector(&settings());

    let stats = detector.detect(&CancellationSignal::new()).await.unwrap();

    assert_eq!(stats.last_mark, 40);
    assert_eq!(stats.current_mark, 5);
    assert!(stats.current_mark <= stats.highest_sequence);
}

/// Marking persists only a moved mark
#[tokio::test]
async fn test_mark_persists_high_water_progression() {
    let fixture = Fixture::new();
    fixture.append(4);
    let detector = fixture.detector(&settings());

    let stats = detector.detect(&CancellationSignal::new()).await.unwrap();
    detector.mark(&stats).await.unwrap();
    assert_eq!(fixture.log.progression(HIGH_WATER_MARK), Some(4));

    let unchanged = detector.detect(&CancellationSignal::new()).await.unwrap();
    assert!(!unchanged.has_changed());
    detector.mark(&unchanged).await.unwrap();
    assert_eq!(fixture.log.progression(HIGH_WATER_MARK), Some(4));
}

/// Two detectors sharing the mark row never move it backwards
#[tokio::test]
async fn test_stale_detector_cannot_lower_shared_mark() {
    let fixture = Fixture::new();
    fixture.append(3);
    let reserved = fixture.log.reserve_sequences(1);
    fixture.append(2);
    let slow = fixture.detector(&settings());
    let fast = fixture.detector(&settings());
    let cancel = CancellationSignal::new();

    let stale = slow.detect(&cancel).await.unwrap();
    assert_eq!(stale.current_mark, 3);

    fixture
        .log
        .commit_reserved(
            reserved[0],
            TenantId::default(),
            StreamIdentity::key("bin-2"),
            opened("sku-2"),
        )
        .unwrap();
    let fresh = fast.detect(&cancel).await.unwrap();
    assert_eq!(fresh.current_mark, 6);
    fast.mark(&fresh).await.unwrap();

    slow.mark(&stale).await.unwrap();
    assert_eq!(fixture.log.progression(HIGH_WATER_MARK), Some(6));

    let caught_up = slow.detect(&cancel).await.unwrap();
    assert_eq!((caught_up.last_mark, caught_up.current_mark), (6, 6));
}

/// A cancelled scan reports cancellation and persists nothing
#[tokio::test]
async fn test_cancelled_detection_leaves_state_untouched() {
    let fixture = Fixture::new();
    fixture.append(4);
    let detector = fixture.detector(&settings());
    let cancel = CancellationSignal::new();
    cancel.cancel();

    let result = detector.detect(&cancel).await;

    assert!(matches!(result, Err(ProjectionError::Cancelled)));
    assert_eq!(fixture.log.progression(HIGH_WATER_MARK), None);
}

/// Read failures propagate unwrapped
#[tokio::test]
async fn test_read_failure_propagates() {
    let fixture = Fixture::new();
    fixture.append(2);
    fixture.log.set_unavailable(true);
    let detector = fixture.detector(&settings());

    let err = detector.detect(&CancellationSignal::new()).await.unwrap_err();

    assert!(matches!(
        err,
        ProjectionError::Storage(StorageError::Transient(_))
    ));
    assert!(err.is_transient());
}

// ============================================================================
// DetectInSafeZone
// ============================================================================

/// Gaps older than the safe zone are skipped; the first gap inside it stops
/// the scan
#[tokio::test]
async fn test_safe_zone_skips_stale_gaps_and_stops_at_fresh_one() {
    let fixture = Fixture::new();
    // t0: 1, 2, _, 4, 5, _, 7
    fixture.append(2);
    fixture.log.reserve_sequences(1);
    fixture.append(2);
    fixture.log.reserve_sequences(1);
    fixture.append(1);
    // t0 + 10s: 8, _, 10, 11
    fixture.clock.advance(ChronoDuration::seconds(10));
    fixture.append(1);
    fixture.log.reserve_sequences(1);
    fixture.append(2);

    let detector = fixture.detector(&settings());
    let cancel = CancellationSignal::new();

    let safe = detector.detect_in_safe_zone(&cancel).await.unwrap();
    assert_eq!(safe.current_mark, 8);
    assert_eq!(safe.safe_start_mark, 2);
    assert!(safe.skipped_gaps());

    let strict = detector.detect(&cancel).await.unwrap();
    assert_eq!(strict.current_mark, 2);
    assert!(!strict.skipped_gaps());
}

/// A gap whose following event is inside the safe zone is presumed in flight
#[tokio::test]
async fn test_safe_zone_waits_for_recent_gap() {
    let fixture = Fixture::new();
    fixture.append(3);
    fixture.log.reserve_sequences(1);
    fixture.append(2);
    fixture.clock.advance(ChronoDuration::seconds(2));

    let detector = fixture.detector(&settings());
    let stats = detector
        .detect_in_safe_zone(&CancellationSignal::new())
        .await
        .unwrap();

    assert_eq!(stats.current_mark, 3);

    // Once the clock moves past the safe zone the gap is treated as
    // permanent.
    fixture.clock.advance(ChronoDuration::seconds(10));
    let later = detector
        .detect_in_safe_zone(&CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(later.current_mark, 6);
}

/// An event exactly at the horizon is still inside the safe zone
#[tokio::test]
async fn test_safe_zone_cutoff_is_strict() {
    let fixture = Fixture::new();
    fixture.append(1);
    fixture.log.reserve_sequences(1);
    fixture.append(1);
    fixture.clock.advance(ChronoDuration::seconds(5));

    let detector = fixture.detector(&settings());
    let at_horizon = detector
        .detect_in_safe_zone(&CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(at_horizon.current_mark, 1);

    fixture.clock.advance(ChronoDuration::milliseconds(1));
    let past_horizon = detector
        .detect_in_safe_zone(&CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(past_horizon.current_mark, 3);
}

/// A trailing gap has no following event and always stops the scan
#[tokio::test]
async fn test_trailing_gap_stops_safe_zone_scan() {
    let fixture = Fixture::new();
    fixture.append(4);
    fixture.log.reserve_sequences(2);
    fixture.clock.advance(ChronoDuration::minutes(5));

    let detector = fixture.detector(&settings());
    let stats = detector
        .detect_in_safe_zone(&CancellationSignal::new())
        .await
        .unwrap();

    assert_eq!(stats.current_mark, 4);
    assert_eq!(stats.highest_sequence, 6);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Detection stops right before the first missing sequence, whatever the
    /// scan page size, and repeating it changes nothing.
    #[test]
    fn prop_detect_stops_before_first_gap(gapped in gapped_log(60), page in 1usize..8) {
        let fixture = Fixture::new();
        fixture.fill(&gapped);
        let detector = fixture.detector(&settings().with_scan_page_size(page));
        let cancel = CancellationSignal::new();

        let (first, second) = tokio_test::block_on(async {
            let first = detector.detect(&cancel).await.unwrap();
            detector.mark(&first).await.unwrap();
            let second = detector.detect(&cancel).await.unwrap();
            (first, second)
        });

        prop_assert_eq!(first.current_mark, gapped.contiguous_mark());
        prop_assert_eq!(first.highest_sequence, gapped.len);
        prop_assert!(first.current_mark <= first.highest_sequence);
        prop_assert_eq!(second.current_mark, first.current_mark);
    }

    /// Once every gap is older than the safe zone, only a trailing gap can
    /// hold the mark back.
    #[test]
    fn prop_stale_gaps_are_all_skipped(gapped in gapped_log(60)) {
        let fixture = Fixture::new();
        fixture.fill(&gapped);
        fixture.clock.advance(ChronoDuration::minutes(1));
        let detector = fixture.detector(&settings());

        let stats = tokio_test::block_on(detector.detect_in_safe_zone(&CancellationSignal::new()))
            .unwrap();

        let last_committed = fixture.log.committed_sequences().last().copied().unwrap_or(0);
        prop_assert_eq!(stats.current_mark, last_committed);
        prop_assert_eq!(stats.safe_start_mark, gapped.contiguous_mark().min(last_committed));
    }
}
