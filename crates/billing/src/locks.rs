//! Account-scoped locking
//!
//! All invoice generation and payment mutation for one account serializes
//! behind the same advisory lock. Acquisition is try-based with a bounded
//! number of retries; exhaustion fails the operation fast instead of
//! queueing callers indefinitely. The guard releases on every exit path,
//! including timeouts and panics, because release lives in `Drop`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Typed lock handle: one lock per account, keyed by the account's external
/// identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountLockKey {
    account_id: Uuid,
    external_key: String,
}

impl AccountLockKey {
    pub fn new(account_id: Uuid, external_key: &str) -> Self {
        Self {
            account_id,
            external_key: external_key.to_string(),
        }
    }

    pub fn account_id(&self) -> Uuid {
        self.account_id
    }

    pub fn external_key(&self) -> &str {
        &self.external_key
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Total try-lock attempts before giving up
    pub max_attempts: usize,
    /// Delay between attempts
    pub retry_delay: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Holds the lock for one account while alive
#[derive(Debug)]
pub struct AccountLockGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Process-wide registry of per-account locks.
///
/// Entries are retained once created (one per account ever locked in this
/// process); the registry is the in-process equivalent of the distributed
/// advisory lock a multi-node deployment would plug in here.
pub struct AccountLocker {
    config: LockConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccountLocker {
    pub fn new(config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Acquire the account lock, retrying a bounded number of times
    pub async fn lock(&self, key: &AccountLockKey) -> BillingResult<AccountLockGuard> {
        let mutex = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.external_key().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let retries = self.config.max_attempts.saturating_sub(1);
        let strategy = FixedInterval::new(self.config.retry_delay).take(retries);
        let guard = Retry::spawn(strategy, || {
            let mutex = mutex.clone();
            async move { mutex.try_lock_owned().map_err(|_| ()) }
        })
        .await
        .map_err(|_| {
            tracing::warn!(
                account_id = %key.account_id(),
                external_key = %key.external_key(),
                attempts = self.config.max_attempts,
                "Account lock contended, giving up"
            );
            BillingError::LockContended(key.external_key().to_string())
        })?;

        Ok(AccountLockGuard { _guard: guard })
    }
}
