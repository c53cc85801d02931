//! Aggregation of fetch results into batched sheet writes.
//!
//! Results arrive one entity at a time, in completion order, scattered over
//! many rows. The [`ResultAggregator`] collects them per sheet; a
//! [`WriteBatch`] coalesces its cells into as few contiguous range writes as
//! possible; the [`BatchWriter`] pushes those through the credential rotator.
//!
//! ```text
//! rows {3,4,5,9} in column C  -->  C3:C5 = [..3 values..], C9 = [..1 value..]
//! ```

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::a1::CellRange;
use crate::error::{AppError, FailureKind};
use crate::ids::EntityId;
use crate::layout::{Destination, Placement, SheetLayout};
use crate::record::FetchOutcome;
use crate::rotator::CredentialRotator;
use crate::traits::SheetStore;

/// One value bound for one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub destination: Destination,
    pub value: String,
}

/// One contiguous vertical run of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeWrite {
    pub column: u32,
    pub start_row: u32,
    pub values: Vec<String>,
}

impl RangeWrite {
    pub fn range(&self) -> CellRange {
        CellRange::column_run(self.column, self.start_row, self.values.len() as u32)
    }
}

/// Pending cells of one sheet, keyed by `(column, row)`.
///
/// A later write to the same cell replaces the earlier one.
#[derive(Debug, Clone)]
pub struct WriteBatch {
    sheet: String,
    cells: BTreeMap<(u32, u32), String>,
}

impl WriteBatch {
    pub fn new(sheet: impl Into<String>) -> Self {
        Self {
            sheet: sheet.into(),
            cells: BTreeMap::new(),
        }
    }

    pub fn sheet(&self) -> &str {
        &self.sheet
    }

    pub fn insert(&mut self, column: u32, row: u32, value: impl Into<String>) {
        self.cells.insert((column, row), value.into());
    }

    pub fn push(&mut self, write: PendingWrite) {
        self.insert(write.destination.column, write.destination.row, write.value);
    }

    /// Number of distinct cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Merges `other` into this batch; `other` wins on conflicts.
    pub fn merge(&mut self, other: WriteBatch) {
        self.cells.extend(other.cells);
    }

    /// Splits the batch into maximal runs of consecutive rows per column.
    ///
    /// Runs come out ordered by column, then by starting row.
    pub fn coalesce(&self) -> Vec<RangeWrite> {
        let mut runs: Vec<RangeWrite> = Vec::new();
        // BTreeMap order is (column, row), so each run is built in one pass.
        for (&(column, row), value) in &self.cells {
            match runs.last_mut() {
                Some(run)
                    if run.column == column
                        && run.start_row + run.values.len() as u32 == row =>
                {
                    run.values.push(value.clone());
                }
                _ => runs.push(RangeWrite {
                    column,
                    start_row: row,
                    values: vec![value.clone()],
                }),
            }
        }
        runs
    }
}

/// What [`ResultAggregator::record`] did with one outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recorded {
    /// Cells queued.
    pub writes: usize,
    /// Sheets that have no row for the entity.
    pub unmapped_sheets: Vec<String>,
}

impl Recorded {
    /// [`FailureKind::Unmapped`] when some sheet had no row for the entity.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        (!self.unmapped_sheets.is_empty()).then_some(FailureKind::Unmapped)
    }
}

/// Accumulates outcomes into per-sheet write batches.
pub struct ResultAggregator {
    layout: Arc<SheetLayout>,
    pending: BTreeMap<String, WriteBatch>,
    unmapped: BTreeMap<EntityId, BTreeSet<String>>,
}

impl ResultAggregator {
    pub fn new(layout: Arc<SheetLayout>) -> Self {
        Self {
            layout,
            pending: BTreeMap::new(),
            unmapped: BTreeMap::new(),
        }
    }

    /// Queues every routed field of `outcome`, plus any reference block it feeds.
    ///
    /// Fields no sheet takes are ignored. Entities missing from a sheet are
    /// logged and remembered, never retried.
    pub fn record(&mut self, outcome: &FetchOutcome) -> Recorded {
        let mut recorded = Recorded::default();
        if !outcome.is_success() {
            return recorded;
        }

        for (field, value) in &outcome.fields {
            if !self.layout.is_routed(field) {
                tracing::trace!(entity = %outcome.entity, field, "No sheet takes field");
                continue;
            }
            for placement in self.layout.place(&outcome.entity, field) {
                match placement {
                    Placement::Cell(destination) => {
                        self.queue(PendingWrite {
                            destination,
                            value: value.clone(),
                        });
                        recorded.writes += 1;
                    }
                    Placement::Unmapped { sheet } => {
                        if !recorded.unmapped_sheets.contains(&sheet) {
                            recorded.unmapped_sheets.push(sheet);
                        }
                    }
                }
            }
        }

        let layout = Arc::clone(&self.layout);
        for block in layout.reference_blocks_for(&outcome.entity) {
            for (row, field) in block.range().rows().zip(&block.fields) {
                let value = match (outcome.fields.get(field), &block.missing) {
                    (Some(v), _) => v.clone(),
                    (None, Some(fallback)) => fallback.clone(),
                    (None, None) => continue,
                };
                let write = PendingWrite {
                    destination: Destination {
                        sheet: block.sheet.clone(),
                        row,
                        column: block.anchor.column,
                    },
                    value,
                };
                self.queue(write);
                recorded.writes += 1;
            }
        }

        if !recorded.unmapped_sheets.is_empty() {
            tracing::warn!(
                entity = %outcome.entity,
                sheets = ?recorded.unmapped_sheets,
                "Entity not found in sheet, skipping"
            );
            self.unmapped
                .entry(outcome.entity.clone())
                .or_default()
                .extend(recorded.unmapped_sheets.iter().cloned());
        }

        recorded
    }

    fn queue(&mut self, write: PendingWrite) {
        self.pending
            .entry(write.destination.sheet.clone())
            .or_insert_with_key(|sheet| WriteBatch::new(sheet.clone()))
            .push(write);
    }

    /// Puts back a batch that failed to flush.
    ///
    /// Cells queued since the batch was taken keep their newer values.
    pub fn requeue(&mut self, batch: WriteBatch) {
        match self.pending.entry(batch.sheet.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(batch);
            }
            Entry::Occupied(mut slot) => {
                let newer = std::mem::replace(slot.get_mut(), batch);
                slot.get_mut().merge(newer);
            }
        }
    }

    /// Cells queued and not yet taken.
    pub fn pending_cells(&self) -> usize {
        self.pending.values().map(WriteBatch::len).sum()
    }

    /// Drains every non-empty pending batch, ordered by sheet name.
    pub fn take_batches(&mut self) -> Vec<WriteBatch> {
        std::mem::take(&mut self.pending)
            .into_values()
            .filter(|b| !b.is_empty())
            .collect()
    }

    /// Entities that some sheet had no row for, with those sheets.
    pub fn unmapped(&self) -> &BTreeMap<EntityId, BTreeSet<String>> {
        &self.unmapped
    }
}

/// Writes batches through a [`CredentialRotator`].
#[derive(Clone)]
pub struct BatchWriter<S: SheetStore> {
    rotator: CredentialRotator<S>,
}

impl<S: SheetStore> BatchWriter<S> {
    pub fn new(rotator: CredentialRotator<S>) -> Self {
        Self { rotator }
    }

    /// Writes every run of `batch`, returning the number of cells written.
    ///
    /// A rate limit anywhere restarts the whole batch on the next credential.
    /// Range writes are idempotent, so replaying already-written runs is safe.
    ///
    /// # Errors
    ///
    /// Non-rate-limit store errors, and `AppError::RateLimitExceeded` once
    /// the rotator gives up.
    pub async fn flush(&self, batch: &WriteBatch) -> Result<usize, AppError> {
        let runs = batch.coalesce();
        if runs.is_empty() {
            return Ok(0);
        }

        let sheet = batch.sheet();
        let runs = &runs;
        let written = self
            .rotator
            .call(move |store| async move {
                for run in runs {
                    store
                        .write_range(sheet, &run.range().to_string(), &run.values)
                        .await?;
                }
                Ok(batch.len())
            })
            .await?;

        tracing::debug!(
            sheet,
            ranges = runs.len(),
            cells = written,
            "Flushed write batch"
        );
        Ok(written)
    }
}
