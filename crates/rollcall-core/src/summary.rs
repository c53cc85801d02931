//! Run statistics and the final summary.
//!
//! Pure bookkeeping, decoupled from I/O, so it can be unit tested without a
//! portal or a store.

use std::collections::BTreeMap;

use serde::Serialize;
use uuid::Uuid;

use crate::batch::Recorded;
use crate::error::FailureKind;
use crate::ids::EntityId;
use crate::record::{FetchOutcome, FetchStatus};
use crate::rotator::RotatorStats;

/// Per-outcome counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct FetchStats {
    pub succeeded: usize,
    pub failed_transient: usize,
    pub failed_permanent: usize,
    /// Fetched entities that some sheet had no row for. Also counted as
    /// succeeded.
    pub unmapped: usize,
    /// Sum of attempts over every outcome.
    pub attempts: u64,
}

impl FetchStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, outcome: &FetchOutcome) {
        self.attempts += u64::from(outcome.attempts);
        match &outcome.status {
            FetchStatus::Success => self.succeeded += 1,
            FetchStatus::Failed { kind, .. } => self.count(*kind),
        }
    }

    /// Counts an entity whose placement failed after a successful fetch.
    pub fn record_placement(&mut self, recorded: &Recorded) {
        if let Some(kind) = recorded.failure_kind() {
            self.count(kind);
        }
    }

    fn count(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Transient => self.failed_transient += 1,
            FailureKind::Permanent => self.failed_permanent += 1,
            FailureKind::Unmapped => self.unmapped += 1,
        }
    }

    /// Returns the total number of processed entities.
    pub fn total(&self) -> usize {
        self.succeeded + self.failed()
    }

    pub fn failed(&self) -> usize {
        self.failed_transient + self.failed_permanent
    }
}

/// Flush result for one sheet, over the whole run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SheetFlushResult {
    pub sheet: String,
    pub cells_written: usize,
    /// Last flush error for this sheet, if any flush failed.
    pub error: Option<String>,
}

impl SheetFlushResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Summary of a complete harvest run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Timestamp written into the header row of new columns.
    pub timestamp: String,
    pub stats: FetchStats,
    /// Failed entities with the reason of their last attempt.
    pub failures: BTreeMap<EntityId, String>,
    /// Entities some sheet had no row for, with those sheets.
    pub unmapped: BTreeMap<EntityId, Vec<String>>,
    pub sheets: Vec<SheetFlushResult>,
    pub cancelled: bool,
    pub rotator: RotatorStats,
}

impl RunSummary {
    /// Total entities processed.
    pub fn total(&self) -> usize {
        self.stats.total()
    }

    pub fn successes(&self) -> usize {
        self.stats.succeeded
    }

    pub fn cells_written(&self) -> usize {
        self.sheets.iter().map(|s| s.cells_written).sum()
    }

    /// Number of sheets with a failed flush.
    pub fn failed_sheets(&self) -> usize {
        self.sheets.iter().filter(|s| !s.is_success()).count()
    }

    /// False when any sheet failed to flush. Entity failures alone do not count.
    pub fn is_success(&self) -> bool {
        self.failed_sheets() == 0
    }

    /// Returns the success rate of fetches as a percentage (0.0 - 100.0).
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        (self.successes() as f64 / self.total() as f64) * 100.0
    }
}
