//! Key-level lock manager for pessimistic transactions.
//!
//! Keys are partitioned across a fixed set of stripes; each stripe
//! owns a mutex-protected lock table and a condition variable for
//! waiters.  A lock entry records its owning transaction and an
//! optional expiration deadline; a later acquirer that finds an
//! expired entry steals it, and the earlier owner discovers the theft
//! when its commit verifies lock ownership.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::DbError;

type LockKey = (u32, Vec<u8>);

#[derive(Debug, Clone)]
struct LockInfo {
    txn_id: u64,
    expires_at: Option<Instant>,
}

impl LockInfo {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct Stripe {
    locks: Mutex<HashMap<LockKey, LockInfo>>,
    cv: Condvar,
}

/// Striped `(column family, user key)` lock table.
pub(crate) struct LockManager {
    stripes: Vec<Stripe>,
}

impl LockManager {
    pub fn new(num_stripes: usize) -> Self {
        let num_stripes = num_stripes.max(1);
        Self {
            stripes: (0..num_stripes)
                .map(|_| Stripe {
                    locks: Mutex::new(HashMap::new()),
                    cv: Condvar::new(),
                })
                .collect(),
        }
    }

    fn stripe_for(&self, cf: u32, key: &[u8]) -> &Stripe {
        let mut hasher = DefaultHasher::new();
        cf.hash(&mut hasher);
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.stripes.len();
        &self.stripes[idx]
    }

    /// Acquires the lock on `(cf, key)` for `txn_id`, waiting up to
    /// `timeout`.  Re-acquisition by the owner refreshes the
    /// expiration.  An expired holder is stolen from.
    pub fn try_lock(
        &self,
        cf: u32,
        key: &[u8],
        txn_id: u64,
        timeout: Duration,
        expires_at: Option<Instant>,
    ) -> Result<(), DbError> {
        let stripe = self.stripe_for(cf, key);
        let deadline = Instant::now() + timeout;
        let lock_key: LockKey = (cf, key.to_vec());

        let mut locks = stripe
            .locks
            .lock()
            .map_err(|_| DbError::Internal("lock table stripe poisoned".into()))?;
        loop {
            match locks.get(&lock_key) {
                None => {
                    locks.insert(lock_key, LockInfo { txn_id, expires_at });
                    return Ok(());
                }
                Some(info) if info.txn_id == txn_id => {
                    locks.insert(lock_key, LockInfo { txn_id, expires_at });
                    return Ok(());
                }
                Some(info) if info.is_expired() => {
                    debug!(
                        cf,
                        stolen_from = info.txn_id,
                        thief = txn_id,
                        "stealing expired lock"
                    );
                    locks.insert(lock_key, LockInfo { txn_id, expires_at });
                    return Ok(());
                }
                Some(info) => {
                    trace!(cf, holder = info.txn_id, waiter = txn_id, "lock wait");
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DbError::TimedOut(format!(
                            "lock on {} bytes key held by transaction {}",
                            key.len(),
                            info.txn_id
                        )));
                    }
                    // Wake early enough to steal an expiring lock.
                    let mut wait_for = deadline - now;
                    if let Some(expiry) = info.expires_at {
                        let until_expiry = expiry.saturating_duration_since(now);
                        wait_for = wait_for.min(until_expiry.max(Duration::from_millis(1)));
                    }
                    let (guard, _timeout) = stripe
                        .cv
                        .wait_timeout(locks, wait_for)
                        .map_err(|_| DbError::Internal("lock table stripe poisoned".into()))?;
                    locks = guard;
                }
            }
        }
    }

    /// Releases `(cf, key)` if `txn_id` still owns it.
    pub fn unlock(&self, cf: u32, key: &[u8], txn_id: u64) {
        let stripe = self.stripe_for(cf, key);
        if let Ok(mut locks) = stripe.locks.lock() {
            let lock_key: LockKey = (cf, key.to_vec());
            if locks.get(&lock_key).is_some_and(|info| info.txn_id == txn_id) {
                locks.remove(&lock_key);
            }
        }
        stripe.cv.notify_all();
    }

    /// True when `txn_id` still holds `(cf, key)` (its lock was not
    /// stolen after expiring).
    pub fn is_held_by(&self, cf: u32, key: &[u8], txn_id: u64) -> bool {
        let stripe = self.stripe_for(cf, key);
        stripe
            .locks
            .lock()
            .map(|locks| {
                locks
                    .get(&(cf, key.to_vec()))
                    .is_some_and(|info| info.txn_id == txn_id)
            })
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("stripes", &self.stripes.len())
            .finish()
    }
}
