//! Progress reporting for harvest runs.
//!
//! [`HarvestService`](crate::harvest::HarvestService) emits [`HarvestEvent`]s
//! instead of logging directly, so a CLI can draw a progress bar while tests
//! and library users stay quiet.

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::ids::EntityId;
use crate::record::{FetchOutcome, FetchStatus};
use crate::summary::RunSummary;

/// Events emitted during a harvest run.
#[derive(Debug, Clone)]
pub enum HarvestEvent<'a> {
    /// Run started.
    RunStarted { run_id: Uuid, entities: usize },
    /// Row mapping of a sheet resolved.
    SheetMapped { sheet: &'a str, rows: usize },
    /// Sheets cleared and columns inserted; fetching starts next.
    DestinationsPrepared { sheets: usize },
    /// One entity finished, successfully or not.
    EntityFetched {
        outcome: &'a FetchOutcome,
        completed: usize,
        total: usize,
    },
    /// Entity was fetched but some sheet has no row for it.
    EntityUnmapped {
        entity: &'a EntityId,
        sheets: &'a [String],
    },
    /// A batch reached the store.
    BatchFlushed { sheet: &'a str, cells: usize },
    /// A batch could not be written.
    FlushFailed { sheet: &'a str, error: &'a str },
    /// Run deadline or caller cancelled; no further fetches start.
    Cancelled { completed: usize, total: usize },
    /// Run finished.
    RunCompleted { summary: &'a RunSummary },
}

/// Trait for reporting harvest progress.
pub trait ProgressReporter: Send + Sync {
    /// Called when a harvest event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: HarvestEvent<'_>) {
        let _ = event;
    }
}

/// Silent reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Tracing-based reporter for CLI/server logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: HarvestEvent<'_>) {
        match event {
            HarvestEvent::RunStarted { run_id, entities } => {
                info!(%run_id, entities, "Harvest started");
            }
            HarvestEvent::SheetMapped { sheet, rows } => {
                tracing::debug!(sheet, rows, "Sheet rows mapped");
            }
            HarvestEvent::DestinationsPrepared { sheets } => {
                info!(sheets, "Destination sheets prepared");
            }
            HarvestEvent::EntityFetched {
                outcome,
                completed,
                total,
            } => match &outcome.status {
                FetchStatus::Success => {
                    info!(
                        entity = %outcome.entity,
                        fields = outcome.fields.len(),
                        "[{}/{}] Fetched",
                        completed,
                        total
                    );
                }
                FetchStatus::Failed { kind, reason } => {
                    warn!(
                        entity = %outcome.entity,
                        %kind,
                        attempts = outcome.attempts,
                        reason = reason.as_str(),
                        "[{}/{}] Failed",
                        completed,
                        total
                    );
                }
            },
            HarvestEvent::EntityUnmapped { entity, sheets } => {
                warn!(%entity, ?sheets, "Entity not found in sheet");
            }
            HarvestEvent::BatchFlushed { sheet, cells } => {
                info!(sheet, cells, "Batch written");
            }
            HarvestEvent::FlushFailed { sheet, error } => {
                error!(sheet, error, "Batch write failed");
            }
            HarvestEvent::Cancelled { completed, total } => {
                warn!(completed, total, "Harvest cancelled");
            }
            HarvestEvent::RunCompleted { summary } => {
                info!(
                    run_id = %summary.run_id,
                    succeeded = summary.stats.succeeded,
                    failed = summary.stats.failed(),
                    unmapped = summary.stats.unmapped,
                    cells = summary.cells_written(),
                    rotations = summary.rotator.rotations,
                    cooldowns = summary.rotator.cooldowns,
                    "Harvest completed"
                );
            }
        }
    }
}
