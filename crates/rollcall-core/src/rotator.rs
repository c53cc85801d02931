//! Credential rotation for rate-limited sheet stores.
//!
//! Each credential gets its own quota from the backend. When the current one
//! is throttled the rotator moves to the next; when every credential has been
//! throttled in a row it sleeps for a global cooldown and starts over.
//!
//! # Identity States
//!
//! ```text
//! ACTIVE --[429 while current]--> RATE_LIMITED --[cooldown]--> ACTIVE
//!    ^                                 |
//!    +----------[success]--------------+
//! ```
//!
//! # Example
//!
//! ```ignore
//! use rollcall_core::rotator::{CredentialRotator, RotatorConfig};
//!
//! let rotator = CredentialRotator::from_factory(&factory, &credentials, RotatorConfig::default())?;
//!
//! // Wrap store calls; 429s rotate transparently
//! rotator
//!     .call(|store| async move { store.write_cell("CN", "E12", "87.5 %").await })
//!     .await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::traits::{SheetStore, StoreFactory};

/// State of one credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityState {
    Active,
    RateLimited,
}

impl fmt::Display for IdentityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityState::Active => write!(f, "active"),
            IdentityState::RateLimited => write!(f, "rate-limited"),
        }
    }
}

/// Configuration for rotation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotatorConfig {
    /// Pause once every credential has been throttled in a row.
    #[serde(rename = "cooldown_secs", with = "crate::config::duration_secs")]
    pub cooldown: Duration,

    /// Cooldowns a single [`CredentialRotator::call`] may sit through before
    /// giving up with [`AppError::RateLimitExceeded`].
    pub max_cooldowns: u32,
}

impl Default for RotatorConfig {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(60),
            max_cooldowns: 2,
        }
    }
}

/// What a rate-limit report did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    /// The lease was stale; another writer already moved on.
    AlreadyRotated,
    /// Switched to the credential at `to`.
    Rotated { to: usize },
    /// Every credential was throttled; slept and reset all of them.
    CooledDown,
    /// Every credential was throttled and no cooldown was allowed.
    Exhausted,
}

/// A store handle together with the rotation generation it was taken in.
///
/// Hand the lease back to [`CredentialRotator::report_rate_limit`] so that
/// reports from writers holding an outdated lease are ignored.
#[derive(Debug, Clone)]
pub struct StoreLease<S> {
    pub index: usize,
    pub generation: u64,
    pub store: S,
}

/// Statistics about rotator state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct RotatorStats {
    /// Index of the credential currently in use.
    pub current: usize,
    pub states: Vec<IdentityState>,
    /// Number of rotations to another credential.
    pub rotations: u64,
    /// Number of global cooldowns performed.
    pub cooldowns: u64,
}

#[derive(Debug)]
struct RotatorInner {
    current: usize,
    generation: u64,
    states: Vec<IdentityState>,
    /// First credential throttled in the ongoing escalation.
    escalation_origin: Option<usize>,
    rotations: u64,
    cooldowns: u64,
}

/// Shared, thread-safe pool of sheet store credentials.
///
/// All state sits behind one async mutex which stays locked during the
/// cooldown sleep, so concurrent writers never rotate twice for the same
/// throttle or cool down twice for the same cycle.
#[derive(Clone)]
pub struct CredentialRotator<S: SheetStore> {
    config: RotatorConfig,
    stores: Arc<Vec<S>>,
    inner: Arc<Mutex<RotatorInner>>,
}

impl<S: SheetStore> CredentialRotator<S> {
    /// Creates a rotator over already-connected stores, in rotation order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if `stores` is empty.
    pub fn new(stores: Vec<S>, config: RotatorConfig) -> Result<Self, AppError> {
        if stores.is_empty() {
            return Err(AppError::ConfigError(
                "At least one store credential is required".to_string(),
            ));
        }
        let inner = RotatorInner {
            current: 0,
            generation: 0,
            states: vec![IdentityState::Active; stores.len()],
            escalation_origin: None,
            rotations: 0,
            cooldowns: 0,
        };
        Ok(Self {
            config,
            stores: Arc::new(stores),
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Connects every credential through `factory`.
    pub fn from_factory<F>(
        factory: &F,
        credentials: &[String],
        config: RotatorConfig,
    ) -> Result<Self, AppError>
    where
        F: StoreFactory<Store = S>,
    {
        let stores = credentials
            .iter()
            .map(|c| factory.connect(c))
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(credentials = stores.len(), "Connected sheet store credentials");
        Self::new(stores, config)
    }

    /// Number of credentials.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Leases the credential currently in use.
    pub async fn current(&self) -> StoreLease<S> {
        let inner = self.inner.lock().await;
        StoreLease {
            index: inner.current,
            generation: inner.generation,
            store: self.stores[inner.current].clone(),
        }
    }

    /// Reports that `lease` was throttled.
    pub async fn report_rate_limit(&self, lease: &StoreLease<S>) -> Rotation {
        self.escalate(lease, true).await
    }

    /// Records a successful operation, ending any ongoing escalation.
    ///
    /// Successes on a lease taken before the latest rotation or cooldown are
    /// ignored, so a late report cannot restart an escalation cycle.
    pub async fn report_success(&self, lease: &StoreLease<S>) {
        let mut inner = self.inner.lock().await;
        if lease.generation != inner.generation || lease.index != inner.current {
            return;
        }
        inner.states[lease.index] = IdentityState::Active;
        inner.escalation_origin = None;
    }

    /// Runs `operation` against the current credential, rotating on throttles.
    ///
    /// - On success: returns the value
    /// - On a rate-limit error: rotates (or cools down) and tries again
    /// - On any other error: returns it unchanged
    ///
    /// Gives up with [`AppError::RateLimitExceeded`] once all credentials are
    /// throttled again after `max_cooldowns` cooldowns.
    pub async fn call<T, F, Fut>(&self, mut operation: F) -> Result<T, AppError>
    where
        F: FnMut(S) -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let mut cooldowns = 0u32;

        loop {
            let lease = self.current().await;
            match operation(lease.store.clone()).await {
                Ok(value) => {
                    self.report_success(&lease).await;
                    return Ok(value);
                }
                Err(e) if e.is_rate_limit() => {
                    tracing::warn!(
                        credential = lease.index,
                        error = %e,
                        "Sheet store rate limited"
                    );
                    let allow_cooldown = cooldowns < self.config.max_cooldowns;
                    match self.escalate(&lease, allow_cooldown).await {
                        Rotation::CooledDown => cooldowns += 1,
                        Rotation::Exhausted => return Err(AppError::RateLimitExceeded),
                        Rotation::AlreadyRotated | Rotation::Rotated { .. } => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns rotator statistics for monitoring.
    pub async fn stats(&self) -> RotatorStats {
        let inner = self.inner.lock().await;
        RotatorStats {
            current: inner.current,
            states: inner.states.clone(),
            rotations: inner.rotations,
            cooldowns: inner.cooldowns,
        }
    }

    async fn escalate(&self, lease: &StoreLease<S>, allow_cooldown: bool) -> Rotation {
        let mut inner = self.inner.lock().await;

        if lease.generation != inner.generation || lease.index != inner.current {
            return Rotation::AlreadyRotated;
        }

        let n = self.stores.len();
        inner.states[lease.index] = IdentityState::RateLimited;
        let origin = *inner.escalation_origin.get_or_insert(lease.index);
        let next = (lease.index + 1) % n;

        if next != origin {
            inner.current = next;
            inner.generation += 1;
            inner.rotations += 1;
            tracing::warn!(
                from = lease.index,
                to = next,
                "Switched sheet store credential"
            );
            return Rotation::Rotated { to: next };
        }

        if !allow_cooldown {
            tracing::warn!(
                credentials = n,
                "Every credential is rate limited, giving up"
            );
            return Rotation::Exhausted;
        }

        tracing::warn!(
            credentials = n,
            cooldown_secs = self.config.cooldown.as_secs(),
            "Every credential is rate limited, cooling down"
        );
        // Lock stays held so no other writer can act on stale state meanwhile.
        tokio::time::sleep(self.config.cooldown).await;

        inner.states.fill(IdentityState::Active);
        inner.current = origin;
        inner.escalation_origin = None;
        inner.generation += 1;
        inner.cooldowns += 1;
        tracing::info!(credential = origin, "Cooldown finished, credentials reset");
        Rotation::CooledDown
    }
}
