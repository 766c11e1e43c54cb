//! High-water statistics, progression rows and event ranges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Progression name under which the high-water mark is persisted.
pub const HIGH_WATER_MARK: &str = "HighWaterMark";

/// Snapshot of the log's high-water state.
///
/// `current_mark <= highest_sequence` always holds. Without an external
/// reset, `current_mark` never decreases across detections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Highest sequence known to be contiguous from the start of the log.
    pub current_mark: u64,

    /// Previously confirmed mark (the persisted `HighWaterMark` progression).
    pub last_mark: u64,

    /// Highest sequence the generator has assigned.
    pub highest_sequence: u64,

    /// When the mark was last persisted, `None` if never.
    pub last_updated: Option<DateTime<Utc>>,

    /// Mark reached before skipping any gap.
    ///
    /// Equal to `current_mark` for a plain detection. A safe-zone detection
    /// may advance `current_mark` past stale gaps; this field records where
    /// the contiguous prefix actually ended.
    pub safe_start_mark: u64,
}

impl Statistics {
    /// Statistics for a log that has never assigned a sequence.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            current_mark: 0,
            last_mark: 0,
            highest_sequence: 1,
            last_updated: None,
            safe_start_mark: 0,
        }
    }

    /// Whether detection moved the mark.
    #[must_use]
    pub const fn has_changed(&self) -> bool {
        self.current_mark != self.last_mark
    }

    /// Whether the mark had to skip over at least one gap.
    #[must_use]
    pub const fn skipped_gaps(&self) -> bool {
        self.current_mark != self.safe_start_mark
    }
}

/// One committed sequence number and its commit time, as seen by a log scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceEntry {
    /// Global sequence number.
    pub sequence: u64,
    /// Commit timestamp of the event holding it.
    pub timestamp: DateTime<Utc>,
}

/// Durable progression row: the last sequence a shard confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardProgress {
    /// Last confirmed sequence.
    pub sequence: u64,
    /// When the row was last written.
    pub last_updated: DateTime<Utc>,
}

/// Contiguous window `(floor, ceiling]` of the log processed by one shard pass.
///
/// # Examples
///
/// ```
/// use foldline_core::progress::EventRange;
///
/// let range = EventRange::new("Orders:All", 100, 250);
/// assert_eq!(range.size(), 150);
/// assert!(!range.contains(100));
/// assert!(range.contains(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRange {
    /// Shard the range belongs to.
    pub shard_name: String,
    /// Last sequence already processed (exclusive).
    pub floor: u64,
    /// Last sequence to process (inclusive).
    pub ceiling: u64,
}

impl EventRange {
    /// Create a range.
    #[must_use]
    pub fn new(shard_name: impl Into<String>, floor: u64, ceiling: u64) -> Self {
        Self {
            shard_name: shard_name.into(),
            floor,
            ceiling,
        }
    }

    /// Number of sequence numbers in the range.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.ceiling.saturating_sub(self.floor)
    }

    /// Whether the range contains no sequence numbers.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.ceiling <= self.floor
    }

    /// Whether `sequence` falls inside the range.
    #[must_use]
    pub const fn contains(&self, sequence: u64) -> bool {
        sequence > self.floor && sequence <= self.ceiling
    }
}

impl fmt::Display for EventRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}]", self.shard_name, self.floor, self.ceiling)
    }
}
