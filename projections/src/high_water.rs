//! High-water detection.
//!
//! Sequence numbers are reserved when a transaction starts appending and only
//! become visible when it commits. A transaction that is still in flight, or
//! that rolled back, leaves a gap. Consumers must not read past such a gap:
//! a still-running transaction would later fill it with events the consumer
//! already skipped.
//!
//! [`HighWaterDetector`] scans the committed sequences above the last
//! persisted mark and reports the end of the contiguous prefix.
//!
//! # Safe zone
//!
//! A gap left by a rolled-back transaction never fills. To avoid stalling on
//! it forever, [`HighWaterDetector::detect_in_safe_zone`] treats a gap as
//! permanent once the first event committed after it is older than
//! `now - safe_zone`. Gaps whose following event is inside the safe zone, and
//! a trailing gap with no following event at all, are presumed in flight and
//! stop the scan.

use crate::metrics::HighWaterMetrics;
use chrono::{DateTime, Utc};
use foldline_core::cancellation::CancellationSignal;
use foldline_core::config::DaemonSettings;
use foldline_core::environment::Clock;
use foldline_core::error::{ProjectionError, Result};
use foldline_core::event_log::EventLog;
use foldline_core::progress::{HIGH_WATER_MARK, Statistics};
use std::sync::Arc;
use std::time::Duration;

/// Detects the safe consumption point of an event log.
///
/// Each detector is driven by a single loop; calls are not expected to
/// overlap.
pub struct HighWaterDetector {
    log: Arc<dyn EventLog>,
    clock: Arc<dyn Clock>,
    safe_zone: Duration,
    scan_page_size: usize,
}

/// Where a scan ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanOutcome {
    /// End of the contiguous prefix before any gap.
    contiguous: u64,
    /// End of the prefix after skipping permanent gaps.
    current: u64,
}

impl HighWaterDetector {
    /// Create a detector reading `log`, with safe zone and scan page size
    /// taken from `settings`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, clock: Arc<dyn Clock>, settings: &DaemonSettings) -> Self {
        Self {
            log,
            clock,
            safe_zone: settings.safe_zone(),
            scan_page_size: settings.scan_page_size.max(1),
        }
    }

    /// Detect the end of the contiguous committed prefix.
    ///
    /// Stops at the first gap. Repeated calls against a log with a permanent
    /// gap return the same mark until the gap is filled.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Storage`] if the log cannot be read
    /// - [`ProjectionError::Cancelled`] if `cancel` fires during the scan
    #[tracing::instrument(skip_all, name = "high_water.detect")]
    pub async fn detect(&self, cancel: &CancellationSignal) -> Result<Statistics> {
        self.run(None, cancel).await
    }

    /// Detect the end of the committed prefix, skipping gaps older than the
    /// safe zone.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Storage`] if the log cannot be read
    /// - [`ProjectionError::Cancelled`] if `cancel` fires during the scan
    #[tracing::instrument(skip_all, name = "high_water.detect_in_safe_zone")]
    pub async fn detect_in_safe_zone(&self, cancel: &CancellationSignal) -> Result<Statistics> {
        let safe_zone =
            chrono::Duration::from_std(self.safe_zone).unwrap_or_else(|_| chrono::Duration::zero());
        let horizon = self.clock.now() - safe_zone;
        self.run(Some(horizon), cancel).await
    }

    /// Persist `statistics.current_mark` as the high-water mark if it moved.
    ///
    /// Several shards share the mark row. The write only lands if the row
    /// still holds `statistics.last_mark`, so a detector working from a stale
    /// read never moves the mark backwards; it is picked up again on the
    /// next detection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the progression cannot be saved.
    pub async fn mark(&self, statistics: &Statistics) -> Result<()> {
        if !statistics.has_changed() {
            return Ok(());
        }

        let advanced = self
            .log
            .advance_progression(HIGH_WATER_MARK, statistics.last_mark, statistics.current_mark)
            .await?;
        if !advanced {
            tracing::debug!(
                last_mark = statistics.last_mark,
                current_mark = statistics.current_mark,
                "High-water mark moved concurrently; keeping the stored value"
            );
            return Ok(());
        }

        tracing::debug!(
            last_mark = statistics.last_mark,
            current_mark = statistics.current_mark,
            "High-water mark persisted"
        );
        Ok(())
    }

    async fn run(
        &self,
        horizon: Option<DateTime<Utc>>,
        cancel: &CancellationSignal,
    ) -> Result<Statistics> {
        if cancel.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }

        let highest_sequence = self.log.highest_sequence().await?;
        let progress = self.log.load_progression(HIGH_WATER_MARK).await?;
        let last_mark = progress.map_or(0, |p| p.sequence);
        let last_updated = progress.map(|p| p.last_updated);

        let outcome = if highest_sequence < last_mark {
            tracing::warn!(
                last_mark,
                highest_sequence,
                "Sequence generator is behind the persisted mark; the log was reset"
            );
            ScanOutcome {
                contiguous: highest_sequence,
                current: highest_sequence,
            }
        } else {
            self.scan(last_mark, highest_sequence, horizon, cancel)
                .await?
        };

        let statistics = Statistics {
            current_mark: outcome.current,
            last_mark,
            highest_sequence,
            last_updated,
            safe_start_mark: outcome.contiguous,
        };

        HighWaterMetrics::record(&statistics);
        if statistics.skipped_gaps() {
            tracing::warn!(
                safe_start_mark = statistics.safe_start_mark,
                current_mark = statistics.current_mark,
                "Skipped gaps older than the safe zone"
            );
        }
        tracing::debug!(
            current_mark = statistics.current_mark,
            last_mark,
            highest_sequence,
            "High water detected"
        );
        Ok(statistics)
    }

    async fn scan(
        &self,
        last_mark: u64,
        highest_sequence: u64,
        horizon: Option<DateTime<Utc>>,
        cancel: &CancellationSignal,
    ) -> Result<ScanOutcome> {
        let mut current = last_mark;
        let mut contiguous: Option<u64> = None;
        let mut after = last_mark;

        while after < highest_sequence {
            if cancel.is_cancelled() {
                return Err(ProjectionError::Cancelled);
            }

            let page = self
                .log
                .scan_sequences(after, highest_sequence, self.scan_page_size)
                .await?;

            for entry in &page {
                if entry.sequence <= current {
                    continue;
                }
                let expected = current + 1;
                if entry.sequence != expected {
                    let permanent = horizon.is_some_and(|h| entry.timestamp < h);
                    tracing::debug!(
                        gap_start = expected,
                        gap_end = entry.sequence - 1,
                        permanent,
                        "Gap in committed sequences"
                    );
                    if !permanent {
                        return Ok(ScanOutcome {
                            contiguous: contiguous.unwrap_or(current),
                            current,
                        });
                    }
                    contiguous.get_or_insert(current);
                }
                current = entry.sequence;
            }

            match page.last() {
                Some(last) if page.len() >= self.scan_page_size => after = last.sequence,
                // Short page: everything up to `highest_sequence` has been seen.
                _ => break,
            }
        }

        Ok(ScanOutcome {
            contiguous: contiguous.unwrap_or(current),
            current,
        })
    }
}
