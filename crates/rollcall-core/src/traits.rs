//! Trait definitions for external dependencies.
//!
//! The harvester never talks to a browser or a spreadsheet API directly. It
//! depends on these traits, so a real portal scraper or Sheets client can be
//! plugged in by a frontend and tests can use in-memory mocks.
//!
//! # Example
//!
//! ```
//! use rollcall_core::traits::SheetStore;
//! use rollcall_core::AppError;
//!
//! // Business logic uses traits, not concrete types
//! async fn stamp_header<S: SheetStore>(store: &S, sheet: &str) -> Result<(), AppError> {
//!     store.insert_column(sheet, 5).await?;
//!     store.write_cell(sheet, "E10", "2025-01-06 09:30 AM").await
//! }
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::ids::EntityId;
use crate::record::AttendanceRecord;

/// Client for the attendance portal.
///
/// Each fetch attempt opens its own [`PortalSession`], so sessions are never
/// shared between tasks.
pub trait PortalClient: Send + Sync + Clone + 'static {
    /// Session type produced by [`open_session`](Self::open_session).
    type Session: PortalSession;

    /// Opens a fresh, logged-out session (a browser instance or HTTP cookie jar).
    fn open_session(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;
}

/// One exclusive portal session.
///
/// The caller always invokes [`close`](Self::close) once it is done with the
/// session, whether the fetch succeeded, failed or timed out.
pub trait PortalSession: Send + Sized + 'static {
    /// Logs in as `id` and scrapes the attendance summary.
    ///
    /// # Arguments
    ///
    /// * `id` - The entity whose record is fetched
    /// * `timeout` - Budget for the whole attempt, for implementations that
    ///   configure page-load or element waits
    ///
    /// # Errors
    ///
    /// Implementations should map a missing page element to
    /// [`AppError::ElementNotFound`] and a refused login to
    /// [`AppError::LoginRejected`], so the retry policy can tell them apart.
    fn login_and_fetch(
        &mut self,
        id: &EntityId,
        timeout: Duration,
    ) -> impl Future<Output = Result<AttendanceRecord, AppError>> + Send;

    /// Releases the session.
    fn close(self) -> impl Future<Output = ()> + Send;
}

/// Tabular backend holding the destination sheets.
///
/// Ranges are A1 strings relative to `sheet` (see [`crate::a1`]). Quota errors
/// must be reported as [`AppError::StoreError`] with
/// [`StoreErrorKind::RateLimit`](crate::error::StoreErrorKind::RateLimit) so
/// the [`CredentialRotator`](crate::rotator::CredentialRotator) can react.
pub trait SheetStore: Send + Sync + Clone + 'static {
    /// Reads the values of a single-column range, top to bottom.
    ///
    /// The returned vector may be shorter than the range when trailing cells
    /// are empty. Element `i` belongs to row `start_row + i`.
    fn read_column_range(
        &self,
        sheet: &str,
        range: &str,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;

    /// Inserts an empty column before the 1-based `column`, shifting the rest right.
    fn insert_column(
        &self,
        sheet: &str,
        column: u32,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Writes one value into a single cell such as `E10`.
    fn write_cell(
        &self,
        sheet: &str,
        cell: &str,
        value: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Writes consecutive values down a single-column range.
    fn write_range(
        &self,
        sheet: &str,
        range: &str,
        values: &[String],
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Clears every cell in `range`.
    fn clear_range(
        &self,
        sheet: &str,
        range: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Factory turning an opaque credential handle into a connected store.
///
/// Separate from SheetStore to avoid issues with async trait constructors.
pub trait StoreFactory: Send + Sync {
    /// The type of store this factory creates.
    type Store: SheetStore;

    /// Connects with the given credential.
    ///
    /// # Arguments
    ///
    /// * `credential` - Opaque handle, typically a service-account key path
    fn connect(&self, credential: &str) -> Result<Self::Store, AppError>;
}
