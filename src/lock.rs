//! Distributed Lock
//!
//! Mutual exclusion over named resources, backed by the remote store's
//! conditional-set semantics. The token value is the holder's expiry
//! timestamp, so a crashed holder self-heals once the TTL lapses; release
//! deletes the key only while that expiry is still in the future, because
//! after expiry another holder may already own the name.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::{lock_key, RemoteStore};

/// Long enough to cover a full optimize/copy cycle
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3 * 60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);
/// max_retries * retry_delay caps total wait at roughly one minute
const DEFAULT_MAX_RETRIES: u32 = 300;

/// Configuration for lock acquisition
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// TTL of the lock token; also bounds how long a crashed holder can
    /// block other writers
    pub timeout: Duration,
    /// Delay between acquisition attempts
    pub retry_delay: Duration,
    /// Attempts before giving up with `LockAcquisitionExceeded`
    pub max_retries: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// Distributed mutual-exclusion primitive over named resources
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn RemoteStore>,
    config: LockConfig,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    pub fn with_config(store: Arc<dyn RemoteStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Acquire the lock for `name`, retrying with a fixed delay up to the
    /// configured bound. Both a held lock and a store transport failure
    /// count against the same bound.
    pub async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let key = lock_key(name);
        let mut attempt: u32 = 0;

        loop {
            let expires_at_ms =
                Utc::now().timestamp_millis() + self.config.timeout.as_millis() as i64 + 1;

            match self
                .store
                .set_nx(&key, &expires_at_ms.to_string(), self.config.timeout)
                .await
            {
                Ok(true) => {
                    debug!(lock = %key, "lock acquired");
                    return Ok(LockGuard {
                        store: Arc::clone(&self.store),
                        key,
                        expires_at_ms,
                    });
                }
                Ok(false) => {
                    debug!(lock = %key, attempt, "lock held, retrying");
                }
                Err(err) => {
                    warn!(lock = %key, attempt, "lock acquisition attempt failed: {err}");
                }
            }

            attempt += 1;
            if attempt > self.config.max_retries {
                return Err(Error::LockAcquisitionExceeded {
                    name: name.to_string(),
                    retries: self.config.max_retries,
                });
            }
            sleep(self.config.retry_delay).await;
        }
    }
}

/// Held lock; call [`LockGuard::release`] when the critical section ends.
///
/// An unreleased guard is not fatal: the token's TTL reclaims the name.
pub struct LockGuard {
    store: Arc<dyn RemoteStore>,
    key: String,
    expires_at_ms: i64,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Best-effort release. Once the recorded expiry has passed this is a
    /// no-op: the key may now belong to another holder and deleting it
    /// would break their critical section. Failures are logged, never
    /// propagated.
    pub async fn release(self) {
        if Utc::now().timestamp_millis() >= self.expires_at_ms {
            debug!(lock = %self.key, "lock already expired, skipping release");
            return;
        }
        if let Err(err) = self.store.del(&self.key).await {
            warn!(lock = %self.key, "failed to release lock: {err}");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
