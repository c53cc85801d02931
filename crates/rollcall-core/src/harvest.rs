//! Harvest service: one complete attendance run.
//!
//! # Architecture
//!
//! The [`HarvestService`] is generic over two traits:
//! - [`PortalClient`] - opens one login session per entity
//! - [`SheetStore`] - the spreadsheet, reached through a [`CredentialRotator`]
//!
//! A run goes through three phases:
//!
//! 1. **Setup** (sequential): read every sheet's key column into a
//!    [`RowMapping`](crate::layout::RowMapping), clear configured ranges,
//!    insert the new columns and stamp them with the run timestamp.
//! 2. **Fetch** (concurrent): the [`WorkerPool`] runs one
//!    [`RetryingFetcher`] task per entity. Outcomes stream back in completion
//!    order into a [`ResultAggregator`]; every `flush_every` outcomes the
//!    pending batches are written so a crash late in the run keeps earlier
//!    results.
//! 3. **Final flush**: whatever is still pending is written sheet by sheet.
//!    A failing sheet is recorded in the [`RunSummary`] and does not stop the
//!    others.
//!
//! Setup errors abort the run with `Err`. Once fetching starts, the run always
//! ends with a summary.
//!
//! # Cancellation Support
//!
//! [`run_cancellable`](HarvestService::run_cancellable) takes a
//! `CancellationToken`; `run_timeout_secs` in the config cancels a child of it.
//! On cancellation:
//! - No further fetches start
//! - In-flight fetches finish and their results are flushed
//! - The summary reports `cancelled = true`

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::a1::{CellRange, CellRef, column_index};
use crate::batch::{BatchWriter, ResultAggregator, WriteBatch};
use crate::config::{HarvestConfig, SheetConfig, SheetMode};
use crate::error::AppError;
use crate::fetcher::RetryingFetcher;
use crate::ids::{EntityId, EntityIdSource};
use crate::layout::{SheetLayout, build_row_mapping};
use crate::pool::WorkerPool;
use crate::progress::{HarvestEvent, ProgressReporter, SilentReporter};
use crate::record::FetchStatus;
use crate::rotator::CredentialRotator;
use crate::summary::{FetchStats, RunSummary, SheetFlushResult};
use crate::traits::{PortalClient, SheetStore, StoreFactory};

/// Service for harvesting attendance records into spreadsheets.
///
/// # Type Parameters
///
/// * `P` - Portal client implementation
/// * `S` - Sheet store implementation
///
/// # Example
///
/// ```ignore
/// use rollcall_core::harvest::HarvestService;
///
/// let service = HarvestService::from_factory(portal, &sheets_factory, config)?;
/// let summary = service.run(service.entity_ids()).await?;
/// println!("{} of {} fetched", summary.successes(), summary.total());
/// ```
pub struct HarvestService<P, S>
where
    P: PortalClient,
    S: SheetStore,
{
    portal: P,
    rotator: CredentialRotator<S>,
    config: HarvestConfig,
}

impl<P, S> Clone for HarvestService<P, S>
where
    P: PortalClient,
    S: SheetStore,
{
    fn clone(&self) -> Self {
        Self {
            portal: self.portal.clone(),
            rotator: self.rotator.clone(),
            config: self.config.clone(),
        }
    }
}

impl<P, S> HarvestService<P, S>
where
    P: PortalClient,
    S: SheetStore,
{
    /// Creates a harvest service over an existing rotator.
    pub fn new(portal: P, rotator: CredentialRotator<S>, config: HarvestConfig) -> Self {
        Self {
            portal,
            rotator,
            config,
        }
    }

    /// Validates `config` and connects every configured credential.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` for an invalid configuration, or
    /// whatever the factory returns for a credential it cannot connect.
    pub fn from_factory<F>(portal: P, factory: &F, config: HarvestConfig) -> Result<Self, AppError>
    where
        F: StoreFactory<Store = S>,
    {
        config.validate()?;
        let rotator =
            CredentialRotator::from_factory(factory, &config.credentials, config.rotator.clone())?;
        Ok(Self::new(portal, rotator, config))
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn rotator(&self) -> &CredentialRotator<S> {
        &self.rotator
    }

    /// The configured id enumeration.
    pub fn entity_ids(&self) -> Vec<EntityId> {
        EntityIdSource::new(self.config.ids.clone()).generate()
    }

    /// Harvests `entity_ids` and returns the run summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the destination sheets cannot be read or prepared.
    /// Entity and flush failures are reported in the summary instead.
    pub async fn run(&self, entity_ids: Vec<EntityId>) -> Result<RunSummary, AppError> {
        self.run_with_progress(entity_ids, &SilentReporter).await
    }

    /// Same as [`run`](Self::run), emitting progress events through `reporter`.
    pub async fn run_with_progress<R: ProgressReporter>(
        &self,
        entity_ids: Vec<EntityId>,
        reporter: &R,
    ) -> Result<RunSummary, AppError> {
        self.run_cancellable(entity_ids, reporter, CancellationToken::new())
            .await
    }

    /// Same as [`run_with_progress`](Self::run_with_progress), stopping early
    /// once `cancel` fires or the configured run timeout elapses.
    pub async fn run_cancellable<R: ProgressReporter>(
        &self,
        entity_ids: Vec<EntityId>,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("harvest", %run_id);
        self.run_inner(run_id, entity_ids, reporter, cancel)
            .instrument(span)
            .await
    }

    async fn run_inner<R: ProgressReporter>(
        &self,
        run_id: Uuid,
        entity_ids: Vec<EntityId>,
        reporter: &R,
        cancel: CancellationToken,
    ) -> Result<RunSummary, AppError> {
        let total = entity_ids.len();
        let timestamp = self.config.timestamp(Utc::now());
        reporter.report(HarvestEvent::RunStarted {
            run_id,
            entities: total,
        });

        if cancel.is_cancelled() {
            reporter.report(HarvestEvent::Cancelled {
                completed: 0,
                total,
            });
            let summary = RunSummary {
                run_id,
                timestamp,
                stats: FetchStats::new(),
                failures: BTreeMap::new(),
                unmapped: BTreeMap::new(),
                sheets: Vec::new(),
                cancelled: true,
                rotator: self.rotator.stats().await,
            };
            reporter.report(HarvestEvent::RunCompleted { summary: &summary });
            return Ok(summary);
        }

        let layout = Arc::new(self.resolve_layout(reporter).await?);
        self.prepare_destinations(&timestamp).await?;
        reporter.report(HarvestEvent::DestinationsPrepared {
            sheets: self.config.sheets.len(),
        });

        let run_cancel = cancel.child_token();
        let deadline = self.config.run_timeout().map(|limit| {
            let token = run_cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => {
                        tracing::warn!(timeout_secs = limit.as_secs(), "Run timeout reached, cancelling");
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            })
        });

        let fetcher = RetryingFetcher::new(
            self.portal.clone(),
            self.config.fetch.clone(),
            self.config.projection.clone(),
        );
        let pool = WorkerPool::new(self.config.concurrency);
        let writer = BatchWriter::new(self.rotator.clone());
        let mut aggregator = ResultAggregator::new(Arc::clone(&layout));
        let mut sheets = self.initial_flush_results(&layout);

        let mut stats = FetchStats::new();
        let mut failures = BTreeMap::new();
        let mut completed = 0usize;

        let mut outcomes = std::pin::pin!(pool.run_all(entity_ids, fetcher, run_cancel.clone()));
        while let Some(outcome) = outcomes.next().await {
            completed += 1;
            stats.record(&outcome);
            if let FetchStatus::Failed { reason, .. } = &outcome.status {
                failures.insert(outcome.entity.clone(), reason.clone());
            }

            let recorded = aggregator.record(&outcome);
            stats.record_placement(&recorded);
            if !recorded.unmapped_sheets.is_empty() {
                reporter.report(HarvestEvent::EntityUnmapped {
                    entity: &outcome.entity,
                    sheets: &recorded.unmapped_sheets,
                });
            }
            reporter.report(HarvestEvent::EntityFetched {
                outcome: &outcome,
                completed,
                total,
            });

            if self.config.flush_every > 0 && completed % self.config.flush_every == 0 {
                for batch in aggregator.take_batches() {
                    match writer.flush(&batch).await {
                        Ok(cells) => {
                            record_flush(&mut sheets, batch.sheet(), cells);
                            reporter.report(HarvestEvent::BatchFlushed {
                                sheet: batch.sheet(),
                                cells,
                            });
                        }
                        Err(e) => {
                            // Kept for the final flush.
                            let error = e.to_string();
                            reporter.report(HarvestEvent::FlushFailed {
                                sheet: batch.sheet(),
                                error: &error,
                            });
                            aggregator.requeue(batch);
                        }
                    }
                }
            }
        }

        if let Some(handle) = deadline {
            handle.abort();
        }

        let cancelled = run_cancel.is_cancelled() && completed < total;
        if cancelled {
            reporter.report(HarvestEvent::Cancelled { completed, total });
        }

        tracing::debug!(cells = aggregator.pending_cells(), "Final flush");
        for batch in aggregator.take_batches() {
            self.final_flush(&writer, &batch, &mut sheets, reporter)
                .await;
        }

        let unmapped = aggregator
            .unmapped()
            .iter()
            .map(|(entity, names)| (entity.clone(), names.iter().cloned().collect()))
            .collect();

        let summary = RunSummary {
            run_id,
            timestamp,
            stats,
            failures,
            unmapped,
            sheets: sheets.into_values().collect(),
            cancelled,
            rotator: self.rotator.stats().await,
        };
        reporter.report(HarvestEvent::RunCompleted { summary: &summary });
        Ok(summary)
    }

    /// Reads every sheet's key column, one sheet at a time.
    async fn resolve_layout<R: ProgressReporter>(
        &self,
        reporter: &R,
    ) -> Result<SheetLayout, AppError> {
        let mut layout = SheetLayout::new();

        for sheet in &self.config.sheets {
            let key_range = CellRange::from_str(&sheet.key_range)?;
            let name = sheet.name.as_str();
            let range = sheet.key_range.as_str();
            let values = self
                .rotator
                .call(move |store| async move { store.read_column_range(name, range).await })
                .await?;

            let rows = build_row_mapping(name, &values, key_range.start.row);
            tracing::debug!(
                sheet = name,
                rows = rows.len(),
                capacity = key_range.height(),
                "Resolved row mapping"
            );
            reporter.report(HarvestEvent::SheetMapped {
                sheet: name,
                rows: rows.len(),
            });
            layout.add_sheet(sheet, rows)?;
        }

        for block in &self.config.reference_blocks {
            layout.add_reference_block(block)?;
        }

        Ok(layout)
    }

    async fn prepare_destinations(&self, timestamp: &str) -> Result<(), AppError> {
        for sheet in &self.config.sheets {
            self.prepare_sheet(sheet, timestamp).await?;
        }
        Ok(())
    }

    /// Clears configured ranges, then inserts and stamps the new column.
    async fn prepare_sheet(&self, sheet: &SheetConfig, timestamp: &str) -> Result<(), AppError> {
        let name = sheet.name.as_str();

        for range in &sheet.clear {
            let range = range.as_str();
            self.rotator
                .call(move |store| async move { store.clear_range(name, range).await })
                .await?;
        }

        if let SheetMode::NewColumn {
            insert_at,
            header_row,
            ..
        } = &sheet.mode
        {
            let column = column_index(insert_at)?;
            self.rotator
                .call(move |store| async move { store.insert_column(name, column).await })
                .await?;

            let cell = CellRef::new(column, *header_row).to_string();
            let cell = cell.as_str();
            self.rotator
                .call(move |store| async move { store.write_cell(name, cell, timestamp).await })
                .await?;
            tracing::debug!(sheet = name, column = insert_at.as_str(), "Inserted run column");
        }

        Ok(())
    }

    /// One entry per destination sheet, in sheet name order.
    fn initial_flush_results(&self, layout: &SheetLayout) -> BTreeMap<String, SheetFlushResult> {
        layout
            .sheet_names()
            .chain(layout.reference_blocks().iter().map(|b| b.sheet.as_str()))
            .map(|sheet| {
                (
                    sheet.to_string(),
                    SheetFlushResult {
                        sheet: sheet.to_string(),
                        ..SheetFlushResult::default()
                    },
                )
            })
            .collect()
    }

    async fn final_flush<R: ProgressReporter>(
        &self,
        writer: &BatchWriter<S>,
        batch: &WriteBatch,
        sheets: &mut BTreeMap<String, SheetFlushResult>,
        reporter: &R,
    ) {
        match writer.flush(batch).await {
            Ok(cells) => {
                record_flush(sheets, batch.sheet(), cells);
                reporter.report(HarvestEvent::BatchFlushed {
                    sheet: batch.sheet(),
                    cells,
                });
            }
            Err(e) => {
                tracing::error!(
                    sheet = batch.sheet(),
                    cells = batch.len(),
                    error = %e,
                    "Final flush failed, results for this sheet are lost"
                );
                let error = e.to_string();
                reporter.report(HarvestEvent::FlushFailed {
                    sheet: batch.sheet(),
                    error: &error,
                });
                sheets
                    .entry(batch.sheet().to_string())
                    .or_insert_with_key(|sheet| SheetFlushResult {
                        sheet: sheet.clone(),
                        ..SheetFlushResult::default()
                    })
                    .error = Some(error);
            }
        }
    }
}

fn record_flush(sheets: &mut BTreeMap<String, SheetFlushResult>, sheet: &str, cells: usize) {
    sheets
        .entry(sheet.to_string())
        .or_insert_with_key(|sheet| SheetFlushResult {
            sheet: sheet.clone(),
            ..SheetFlushResult::default()
        })
        .cells_written += cells;
}
