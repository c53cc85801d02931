//! Per-entity fetch with bounded retries.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{AppError, FailureKind};
use crate::ids::EntityId;
use crate::record::{AttendanceRecord, FetchOutcome, RecordProjection};
use crate::traits::{PortalClient, PortalSession};

/// Retry policy for portal fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchPolicy {
    /// Total attempts per entity, including the first one.
    pub max_attempts: u32,
    /// Upper bound on one attempt (session open plus login and scrape).
    #[serde(rename = "attempt_timeout_secs", with = "crate::config::duration_secs")]
    pub attempt_timeout: Duration,
    /// How long to wait for a session to close before abandoning it.
    #[serde(rename = "close_timeout_secs", with = "crate::config::duration_secs")]
    pub close_timeout: Duration,
    /// Pause between a failed attempt and the next one.
    #[serde(rename = "retry_delay_ms", with = "crate::config::duration_millis")]
    pub retry_delay: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Fetches one entity's record, retrying transient failures.
///
/// [`fetch`](Self::fetch) never returns an error: every way an entity can fail
/// is folded into a [`FetchOutcome`]. Cloning is cheap, so each pool task gets
/// its own copy.
#[derive(Clone)]
pub struct RetryingFetcher<P: PortalClient> {
    portal: P,
    policy: FetchPolicy,
    projection: Arc<RecordProjection>,
}

impl<P: PortalClient> RetryingFetcher<P> {
    pub fn new(portal: P, policy: FetchPolicy, projection: RecordProjection) -> Self {
        Self {
            portal,
            policy,
            projection: Arc::new(projection),
        }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    pub async fn fetch(&self, id: EntityId) -> FetchOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(&id).await {
                Ok(record) => {
                    let fields = self.projection.project(&record);
                    tracing::debug!(
                        entity = %id,
                        attempt,
                        fields = fields.len(),
                        "Fetched attendance record"
                    );
                    return FetchOutcome::success(id, fields, attempt);
                }
                Err(e) => {
                    let kind = e.failure_kind();
                    if kind != FailureKind::Transient {
                        tracing::warn!(
                            entity = %id,
                            attempt,
                            error = %e,
                            "Fetch failed permanently, not retrying"
                        );
                        return FetchOutcome::failed(id, kind, e.to_string(), attempt);
                    }
                    if attempt >= max_attempts {
                        tracing::warn!(
                            entity = %id,
                            attempts = attempt,
                            error = %e,
                            "Giving up after exhausting attempts"
                        );
                        return FetchOutcome::failed(id, kind, e.to_string(), attempt);
                    }
                    tracing::warn!(
                        entity = %id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// One attempt on a fresh session. The session is closed on every path.
    async fn attempt(&self, id: &EntityId) -> Result<AttendanceRecord, AppError> {
        let limit = self.policy.attempt_timeout;
        let deadline = Instant::now() + limit;

        let mut session = match tokio::time::timeout_at(deadline, self.portal.open_session()).await
        {
            Ok(session) => session?,
            Err(_) => return Err(AppError::Timeout(limit)),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        let result =
            match tokio::time::timeout_at(deadline, session.login_and_fetch(id, remaining)).await {
                Ok(result) => result,
                Err(_) => Err(AppError::Timeout(limit)),
            };

        if tokio::time::timeout(self.policy.close_timeout, session.close())
            .await
            .is_err()
        {
            tracing::warn!(
                entity = %id,
                timeout_secs = self.policy.close_timeout.as_secs(),
                "Session close timed out, abandoning session"
            );
        }
        result
    }
}
