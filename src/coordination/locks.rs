//! Lease-based mutual exclusion over a [`LockStore`].
//!
//! A lease is a store key (`key_prefix` + resource key) whose value is a
//! token minted for one particular acquisition.  Whoever created the key with
//! a conditional write holds the lock until it deletes the key or the TTL
//! runs out.  The token is also remembered in an [`OwnershipRegistry`] under
//! the calling task so that extension and release can prove ownership.
//!
//! Two families of calls are exposed:
//!
//! * `acquire` / `try_acquire` / `extend` / `release` / `is_free` report store
//!   failures as [`LockError::Store`].
//! * `lock` / `lock_no_wait` / `delay_lock` / `try_lock` / `unlock` log store
//!   failures and fold them into a negative result, so callers cannot tell a
//!   busy lock from an unreachable store.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use super::ownership::{ContextId, OwnershipRegistry, PendingClaim};
use super::store::LockStore;
use crate::config::{LockConfig, OwnershipCheck, SpinPolicy};
use crate::error::LockError;
use crate::metrics::LockMetrics;

/// One successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_key: String,
    pub storage_key: String,
    pub token: String,
    pub ttl: Duration,
}

pub struct GlobalLock<S> {
    store: S,
    config: LockConfig,
    registry: OwnershipRegistry,
    metrics: Arc<LockMetrics>,
}

impl<S: LockStore> GlobalLock<S> {
    pub fn new(store: S, config: LockConfig) -> Self {
        let registry = OwnershipRegistry::new(config.ownership_mode);
        Self {
            store,
            config,
            registry,
            metrics: Arc::new(LockMetrics::unregistered()),
        }
    }

    /// Report into `metrics` instead of the private default set.
    pub fn with_metrics(mut self, metrics: Arc<LockMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn registry(&self) -> &OwnershipRegistry {
        &self.registry
    }

    /// The store key for `key`.  Fails for an empty key.
    pub fn storage_key(&self, key: &str) -> Result<String, LockError> {
        if key.is_empty() {
            return Err(LockError::InvalidKey);
        }
        Ok(format!("{}{key}", self.config.key_prefix))
    }

    /// Token this context remembers for `key`, if any.
    pub fn holder_token(&self, key: &str) -> Option<String> {
        let storage_key = self.storage_key(key).ok()?;
        self.registry.recall(ContextId::current(), &storage_key)
    }

    // -----------------------------------------------------------------------
    // Acquisition
    // -----------------------------------------------------------------------

    /// Block until the lease on `key` is held, retrying according to the
    /// configured [`SpinPolicy`].
    ///
    /// Without a `wait_timeout` this only returns early on a store failure.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<Lease, LockError> {
        let storage_key = self.storage_key(key)?;
        let context = ContextId::current();
        let token = new_token(context);
        let claim = PendingClaim::record(&self.registry, context, &storage_key, &token);

        let started = Instant::now();
        let deadline = self.config.wait_timeout().map(|t| started + t);
        let mut backoff = Backoff::new(&self.config.spin);
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            match self.store.set_if_absent(&storage_key, &token, ttl).await {
                Ok(true) => {
                    claim.commit();
                    let waited = started.elapsed();
                    self.metrics.acquisitions.inc();
                    self.metrics
                        .acquire_wait_seconds
                        .observe(waited.as_secs_f64());
                    debug!(%key, %token, attempts, ?waited, "lock acquired");
                    return Ok(self.lease(key, storage_key, token, ttl));
                }
                Ok(false) => {
                    self.metrics.contended_attempts.inc();
                    trace!(%key, attempts, "lock held elsewhere; retrying");
                }
                Err(e) => return Err(self.store_failure(e)),
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let waited = started.elapsed();
                self.metrics.timeouts.inc();
                warn!(%key, attempts, ?waited, "gave up waiting for lock");
                return Err(LockError::TimedOut {
                    key: key.to_string(),
                    waited,
                });
            }

            backoff.wait(deadline).await;
        }
    }

    /// One conditional write.  `Ok(None)` means the lock is held by someone
    /// else.
    pub async fn try_acquire(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LockError> {
        let storage_key = self.storage_key(key)?;
        let context = ContextId::current();
        let token = new_token(context);
        let claim = PendingClaim::record(&self.registry, context, &storage_key, &token);

        match self.store.set_if_absent(&storage_key, &token, ttl).await {
            Ok(true) => {
                claim.commit();
                self.metrics.acquisitions.inc();
                debug!(%key, %token, "lock acquired without waiting");
                Ok(Some(self.lease(key, storage_key, token, ttl)))
            }
            Ok(false) => {
                self.metrics.contended_attempts.inc();
                debug!(%key, "lock busy");
                Ok(None)
            }
            Err(e) => Err(self.store_failure(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Extension / release
    // -----------------------------------------------------------------------

    /// Reset the TTL of the lease this context holds on `key`, keeping its
    /// token.  Returns `false` without touching the store record when the
    /// context does not own the lease.
    pub async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let storage_key = self.storage_key(key)?;
        let context = ContextId::current();
        let Some(token) = self.registry.recall(context, &storage_key) else {
            self.metrics.ownership_mismatches.inc();
            debug!(%key, "no lease remembered for this context; nothing to extend");
            return Ok(false);
        };

        let extended = match self.config.ownership_check {
            OwnershipCheck::TwoStep => {
                if self.current_holder(&storage_key).await?.as_deref() == Some(token.as_str()) {
                    self.store
                        .set_with_ttl(&storage_key, &token, ttl)
                        .await
                        .map_err(|e| self.store_failure(e))?;
                    true
                } else {
                    false
                }
            }
            OwnershipCheck::Atomic => self
                .store
                .extend_if_equals(&storage_key, &token, ttl)
                .await
                .map_err(|e| self.store_failure(e))?,
        };

        if extended {
            self.metrics.extensions.inc();
            debug!(%key, ttl_ms = ttl.as_millis() as u64, "lease extended");
        } else {
            self.forget_stale(context, &storage_key, &token);
            warn!(%key, "lease no longer owned by this context; extension skipped");
        }
        Ok(extended)
    }

    /// Delete the lease on `key` if this context still owns it.  Returns
    /// `true` only when a record was removed.
    pub async fn release(&self, key: &str) -> Result<bool, LockError> {
        let storage_key = self.storage_key(key)?;
        let context = ContextId::current();
        let token = match self.registry.recall(context, &storage_key) {
            Some(token) if !token.is_empty() => token,
            _ => {
                self.metrics.ownership_mismatches.inc();
                debug!(%key, "no lease remembered for this context; nothing to release");
                return Ok(false);
            }
        };

        let released = match self.config.ownership_check {
            OwnershipCheck::TwoStep => {
                if self.current_holder(&storage_key).await?.as_deref() == Some(token.as_str()) {
                    let removed = self
                        .store
                        .delete(&storage_key)
                        .await
                        .map_err(|e| self.store_failure(e))?;
                    removed > 0
                } else {
                    false
                }
            }
            OwnershipCheck::Atomic => self
                .store
                .delete_if_equals(&storage_key, &token)
                .await
                .map_err(|e| self.store_failure(e))?,
        };

        if released {
            self.registry.forget_if(context, &storage_key, &token);
            self.metrics.releases.inc();
            debug!(%key, "lock released");
        } else {
            self.forget_stale(context, &storage_key, &token);
            warn!(%key, "lock release: key missing or owned by another holder");
        }
        Ok(released)
    }

    /// Whether no lease currently exists for `key`.  Purely advisory: the
    /// answer can be stale by the time the caller acts on it.
    pub async fn is_free(&self, key: &str) -> Result<bool, LockError> {
        let storage_key = self.storage_key(key)?;
        let exists = self
            .store
            .exists(&storage_key)
            .await
            .map_err(|e| self.store_failure(e))?;
        Ok(!exists)
    }

    // -----------------------------------------------------------------------
    // Fail-soft calls
    // -----------------------------------------------------------------------

    /// Block until the lock is held, using the default TTL.
    ///
    /// A store failure is logged and returns `Ok(())` with no lease held.
    /// With a `wait_timeout` configured, giving up returns
    /// [`LockError::TimedOut`].
    pub async fn lock(&self, key: &str) -> Result<(), LockError> {
        self.lock_for(key, self.config.default_ttl()).await
    }

    pub async fn lock_for(&self, key: &str, ttl: Duration) -> Result<(), LockError> {
        let result = self.acquire(key, ttl).await.map(|_| ());
        fail_soft(key, "lock", ttl, result, ())
    }

    pub async fn lock_no_wait(&self, key: &str) -> Result<bool, LockError> {
        self.lock_no_wait_for(key, self.config.default_ttl()).await
    }

    pub async fn lock_no_wait_for(&self, key: &str, ttl: Duration) -> Result<bool, LockError> {
        let result = self.try_acquire(key, ttl).await.map(|lease| lease.is_some());
        fail_soft(key, "lock_no_wait", ttl, result, false)
    }

    pub async fn delay_lock(&self, key: &str) -> Result<(), LockError> {
        self.delay_lock_for(key, self.config.default_ttl()).await
    }

    /// Extend the lease if this context owns it.  The caller is not told
    /// whether anything happened.
    pub async fn delay_lock_for(&self, key: &str, ttl: Duration) -> Result<(), LockError> {
        let result = self.extend(key, ttl).await.map(|_| ());
        fail_soft(key, "delay_lock", ttl, result, ())
    }

    pub async fn try_lock(&self, key: &str) -> Result<bool, LockError> {
        let result = self.is_free(key).await;
        fail_soft(key, "try_lock", Duration::ZERO, result, false)
    }

    pub async fn unlock(&self, key: &str) -> Result<bool, LockError> {
        let result = self.release(key).await;
        fail_soft(key, "unlock", Duration::ZERO, result, false)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn current_holder(&self, storage_key: &str) -> Result<Option<String>, LockError> {
        self.store
            .get(storage_key)
            .await
            .map_err(|e| self.store_failure(e))
    }

    /// The store no longer holds `token` under `storage_key`.  Tokens are
    /// never reissued, so the record can be dropped without changing the
    /// outcome of any later call.
    fn forget_stale(&self, context: ContextId, storage_key: &str, token: &str) {
        self.metrics.ownership_mismatches.inc();
        if self.registry.forget_if(context, storage_key, token) {
            trace!(%storage_key, "dropped stale lease token");
        }
    }

    fn store_failure(&self, e: anyhow::Error) -> LockError {
        self.metrics.store_errors.inc();
        LockError::Store(e)
    }

    fn lease(&self, key: &str, storage_key: String, token: String, ttl: Duration) -> Lease {
        Lease {
            resource_key: key.to_string(),
            storage_key,
            token,
            ttl,
        }
    }
}

/// Pass `InvalidKey` and `TimedOut` through, log store failures and
/// substitute `fallback`.
fn fail_soft<T>(
    key: &str,
    op: &'static str,
    ttl: Duration,
    result: Result<T, LockError>,
    fallback: T,
) -> Result<T, LockError> {
    match result {
        Ok(value) => Ok(value),
        Err(e @ (LockError::InvalidKey | LockError::TimedOut { .. })) => Err(e),
        Err(e) => {
            let detail = format!("{:#}", anyhow::Error::from(e));
            error!(
                %key,
                op,
                ttl_ms = ttl.as_millis() as u64,
                error = %detail,
                "lock call failed; reporting a negative result"
            );
            Ok(fallback)
        }
    }
}

/// A fresh token: random UUID plus the acquiring context.
fn new_token(context: ContextId) -> String {
    format!("{}-{context}", uuid::Uuid::new_v4().simple())
}

/// Pacing between acquire attempts.
struct Backoff {
    next: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    fn new(policy: &SpinPolicy) -> Self {
        Self {
            next: policy.initial_backoff(),
            max: policy.max_backoff(),
            jitter: policy.jitter,
        }
    }

    async fn wait(&mut self, deadline: Option<Instant>) {
        if self.next.is_zero() {
            // Immediate retry, but let the runtime run other tasks (the holder
            // may share this executor).
            tokio::task::yield_now().await;
            return;
        }

        let mut delay = self.next;
        if self.jitter {
            let ms = delay.as_millis() as u64;
            delay = Duration::from_millis(rand::thread_rng().gen_range(ms / 2..=ms));
        }
        if let Some(deadline) = deadline {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }
        tokio::time::sleep(delay).await;
        self.next = (self.next * 2).min(self.max);
    }
}
