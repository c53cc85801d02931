use std::time::Duration;

use thiserror::Error;

/// Classification of a failure, used to decide whether retrying makes sense.
///
/// Only [`FailureKind::Transient`] failures are retried by the
/// [`RetryingFetcher`](crate::fetcher::RetryingFetcher).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Timeouts, missing page elements, dropped connections.
    Transient,
    /// The entity was fetched but has no row in a destination sheet.
    Unmapped,
    /// Rejected logins, malformed ranges, permission problems.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Unmapped => write!(f, "unmapped"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Spreadsheet store error classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Quota exceeded for the current credential (429)
    RateLimit,
    /// Credential lacks access to the spreadsheet (401/403)
    PermissionDenied,
    /// Range or sheet does not exist (400/404)
    InvalidRange,
    /// Server error (5xx)
    ServerError,
    /// Network/connection error
    NetworkError,
    /// Unknown or unclassified error
    Unknown,
}

/// Structured error details from the spreadsheet store.
#[derive(Debug, Clone)]
pub struct StoreErrorDetails {
    /// The specific error category
    pub kind: StoreErrorKind,
    /// Human-readable error message from the backend
    pub message: String,
    /// HTTP status code, 0 when the request never got a response
    pub status_code: u16,
}

impl StoreErrorDetails {
    /// Create a new StoreErrorDetails
    pub fn new(kind: StoreErrorKind, message: impl Into<String>, status_code: u16) -> Self {
        Self {
            kind,
            message: message.into(),
            status_code,
        }
    }

    /// Classifies a backend HTTP status code.
    ///
    /// ```
    /// use rollcall_core::error::{StoreErrorDetails, StoreErrorKind};
    ///
    /// let details = StoreErrorDetails::from_status(429, "Quota exceeded");
    /// assert_eq!(details.kind, StoreErrorKind::RateLimit);
    /// ```
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let kind = match status_code {
            0 => StoreErrorKind::NetworkError,
            429 => StoreErrorKind::RateLimit,
            401 | 403 => StoreErrorKind::PermissionDenied,
            400 | 404 => StoreErrorKind::InvalidRange,
            500..=599 => StoreErrorKind::ServerError,
            _ => StoreErrorKind::Unknown,
        };
        Self::new(kind, message, status_code)
    }

    /// Shorthand for a 429 response.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::RateLimit, message, 429)
    }
}

impl std::fmt::Display for StoreErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Sheet store error (HTTP {}): {}",
            self.status_code, self.message
        )
    }
}

/// Application-wide error type.
///
/// Portal errors come from the [`PortalClient`](crate::traits::PortalClient)
/// and are classified by [`AppError::failure_kind`]. Store errors carry a
/// [`StoreErrorDetails`] so that rate limiting can be told apart from
/// configuration problems.
#[derive(Error, Debug)]
pub enum AppError {
    /// A portal attempt did not finish within the per-attempt timeout.
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Network or connection error while talking to the portal.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// An expected element was missing from the portal page.
    ///
    /// Usually a half-loaded page, so it is treated as transient.
    #[error("Element not found: {0}")]
    ElementNotFound(String),

    /// The portal refused the login for this entity.
    #[error("Login rejected: {0}")]
    LoginRejected(String),

    /// Spreadsheet store operation failed.
    #[error("Store error: {0}")]
    StoreError(StoreErrorDetails),

    /// Every credential stayed rate limited through the allowed cooldowns.
    #[error("Rate limit exceeded on every credential. Please wait and try again.")]
    RateLimitExceeded,

    /// A1 range or column reference could not be parsed.
    #[error("Invalid range: {0}")]
    InvalidRange(String),

    /// Configuration file error.
    ///
    /// Reading or parsing harvest.toml failed, or it contains invalid values.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic application error for cases not covered by specific variants.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Timeout(limit) => format!(
                "The portal did not respond within {}s.\n   It may be overloaded; try a longer attempt timeout.",
                limit.as_secs_f32()
            ),
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::LoginRejected(msg) => {
                format!("Portal login rejected: {}\n   Check the entity id.", msg)
            }
            AppError::StoreError(details) => match details.kind {
                StoreErrorKind::RateLimit => {
                    "Sheet quota reached.\n   Add more credentials or reduce flush frequency."
                        .to_string()
                }
                StoreErrorKind::PermissionDenied => {
                    "The credential cannot access the spreadsheet.\n   Share the sheet with every service account."
                        .to_string()
                }
                StoreErrorKind::InvalidRange => format!(
                    "The spreadsheet rejected a range: {}\n   Check sheet names and ranges in harvest.toml.",
                    details.message
                ),
                StoreErrorKind::ServerError => format!(
                    "Sheet backend error (HTTP {}).\n   Please try again later.",
                    details.status_code
                ),
                StoreErrorKind::NetworkError => format!(
                    "Network error reaching the sheet backend: {}\n   Check your internet connection.",
                    details.message
                ),
                StoreErrorKind::Unknown => format!("Sheet store error: {}", details.message),
            },
            AppError::RateLimitExceeded => {
                "All credentials are rate limited. Please wait a few minutes and try again."
                    .to_string()
            }
            AppError::ConfigError(msg) => format!(
                "Configuration error: {}\n   Check your configuration file.",
                msg
            ),
            _ => self.to_string(),
        }
    }

    /// Classifies this error for retry decisions.
    ///
    /// # Examples
    ///
    /// ```
    /// use rollcall_core::error::{AppError, FailureKind};
    ///
    /// let err = AppError::ElementNotFound("txtPassword".to_string());
    /// assert_eq!(err.failure_kind(), FailureKind::Transient);
    ///
    /// let err = AppError::LoginRejected("bad id".to_string());
    /// assert_eq!(err.failure_kind(), FailureKind::Permanent);
    /// ```
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::Timeout(_)
            | AppError::NetworkError(_)
            | AppError::ElementNotFound(_)
            | AppError::RateLimitExceeded => FailureKind::Transient,
            AppError::StoreError(details) => match details.kind {
                StoreErrorKind::RateLimit
                | StoreErrorKind::ServerError
                | StoreErrorKind::NetworkError => FailureKind::Transient,
                StoreErrorKind::PermissionDenied
                | StoreErrorKind::InvalidRange
                | StoreErrorKind::Unknown => FailureKind::Permanent,
            },
            AppError::LoginRejected(_)
            | AppError::InvalidRange(_)
            | AppError::ConfigError(_)
            | AppError::Generic(_) => FailureKind::Permanent,
        }
    }

    /// Returns true if this error should be retried.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// Returns true if the store reported a quota problem for the current credential.
    ///
    /// This is the signal that drives [`CredentialRotator`](crate::rotator::CredentialRotator).
    pub fn is_rate_limit(&self) -> bool {
        match self {
            AppError::RateLimitExceeded => true,
            AppError::StoreError(details) => details.kind == StoreErrorKind::RateLimit,
            _ => false,
        }
    }
}
