//! Rollcall Core - concurrent attendance harvesting.
//!
//! This crate fetches per-entity attendance records from a web portal, one
//! login session per entity, and writes them into spreadsheet sheets:
//!
//! - **Fetching**: [`RetryingFetcher`] with bounded retries, run by a
//!   bounded-concurrency [`WorkerPool`]
//! - **Persistence**: [`ResultAggregator`] coalesces scattered cells into range
//!   writes, flushed by a [`BatchWriter`] through a [`CredentialRotator`]
//! - **Orchestration**: [`HarvestService`] ties one run together and returns a
//!   [`RunSummary`]
//! - **Traits**: [`PortalClient`], [`SheetStore`], [`StoreFactory`] for the
//!   external collaborators
//! - **Progress reporting**: [`ProgressReporter`] trait for decoupled logging/UI
//!
//! # Example
//!
//! ```ignore
//! use rollcall_core::{HarvestService, load_harvest_config};
//! use rollcall_core::progress::TracingReporter;
//!
//! let mut config = load_harvest_config(None)?.unwrap_or_default();
//! config.apply_env()?;
//!
//! let harvest = HarvestService::from_factory(portal, &sheets_factory, config)?;
//! let summary = harvest
//!     .run_with_progress(harvest.entity_ids(), &TracingReporter)
//!     .await?;
//! ```

pub mod a1;
pub mod batch;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod harvest;
pub mod ids;
pub mod layout;
pub mod pool;
pub mod progress;
pub mod record;
pub mod rotator;
pub mod summary;
pub mod traits;

#[cfg(test)]
mod testing;

// Configuration
pub use config::{
    HarvestConfig, ReferenceBlockConfig, SheetConfig, SheetMode, default_config_path,
    load_harvest_config,
};

// Error handling
pub use error::{AppError, FailureKind, StoreErrorDetails, StoreErrorKind};

// Entities and records
pub use ids::{EntityId, EntityIdSource, IdConfig};
pub use record::{AttendanceRecord, FetchOutcome, FetchStatus, RecordProjection, SubjectRow};

// Fetching
pub use fetcher::{FetchPolicy, RetryingFetcher};
pub use pool::WorkerPool;

// Persistence
pub use batch::{BatchWriter, RangeWrite, ResultAggregator, WriteBatch};
pub use layout::{Destination, RowMapping, SheetLayout};
pub use rotator::{CredentialRotator, IdentityState, Rotation, RotatorConfig, RotatorStats};

// Harvest service
pub use harvest::HarvestService;
pub use summary::{FetchStats, RunSummary, SheetFlushResult};

// Progress reporting
pub use progress::{HarvestEvent, ProgressReporter, SilentReporter, TracingReporter};

// Traits for dependency injection
pub use traits::{PortalClient, PortalSession, SheetStore, StoreFactory};
