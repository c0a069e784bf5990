//! Concurrency coordination for memory writes and reasoning calls
//!
//! Two independent mechanisms:
//!
//! - **Per-user locks**: one lazily-created async mutex per user id. A batch
//!   touching several users acquires all of their locks in ascending user-id
//!   order, so overlapping batches can never form a circular wait.
//! - **Global throttle**: a counting semaphore bounding how many reasoning
//!   calls are in flight across all channels.
//!
//! Guards release on drop, so a failure while holding them cannot leak a lock.
//! Every wait is cancelled by the shared shutdown token.

use crate::error::{Error, Result};
use dashmap::DashMap;
use std::cmp::Ordering;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Total order used for multi-user lock acquisition.
///
/// Numeric ids (chat-platform snowflakes) sort numerically and before
/// non-numeric ids; ties fall back to plain string order.
pub fn lock_order(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => Ordering::Equal,
    }
    .then_with(|| a.cmp(b))
}

type LockRegistry = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Guards for a set of user locks, held until dropped.
///
/// On drop, locks nobody else holds or waits on leave the registry.
#[derive(Debug)]
pub struct UserLocks {
    user_ids: Vec<String>,
    guards: Vec<OwnedMutexGuard<()>>,
    registry: LockRegistry,
}

impl UserLocks {
    /// Locked user ids in acquisition order
    pub fn user_ids(&self) -> &[String] {
        &self.user_ids
    }

    pub fn holds(&self, user_id: &str) -> bool {
        self.user_ids.iter().any(|u| u == user_id)
    }
}

impl Drop for UserLocks {
    fn drop(&mut self) {
        self.guards.clear();
        for user_id in &self.user_ids {
            self.registry
                .remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Per-user mutual exclusion plus a global reasoning-call throttle
pub struct ConcurrencyCoordinator {
    user_locks: LockRegistry,
    throttle: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl ConcurrencyCoordinator {
    /// Create a coordinator allowing `max_concurrent_calls` reasoning calls at once
    pub fn new(max_concurrent_calls: usize, cancel: CancellationToken) -> Self {
        Self {
            user_locks: Arc::new(DashMap::new()),
            throttle: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
            cancel,
        }
    }

    /// Number of users whose lock is currently held or awaited
    pub fn tracked_users(&self) -> usize {
        self.user_locks.len()
    }

    /// Throttle permits currently free
    pub fn available_permits(&self) -> usize {
        self.throttle.available_permits()
    }

    fn lock_for(&self, user_id: &str) -> Arc<Mutex<()>> {
        self.user_locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the locks of every user in `user_ids`, in ascending order.
    ///
    /// Duplicates are ignored. On cancellation, locks acquired so far are
    /// released before returning `Error::Cancelled`.
    pub async fn lock_users<I, S>(&self, user_ids: I) -> Result<UserLocks>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<String> = user_ids
            .into_iter()
            .map(|u| u.as_ref().to_string())
            .collect();
        ids.sort_by(|a, b| lock_order(a, b));
        ids.dedup();

        // Partial acquisitions are released through `Drop` on cancellation
        let mut locks = UserLocks {
            user_ids: Vec::with_capacity(ids.len()),
            guards: Vec::with_capacity(ids.len()),
            registry: self.user_locks.clone(),
        };
        for user_id in ids {
            let lock = self.lock_for(&user_id);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(Error::Cancelled(format!(
                        "waiting for memory lock of user {}",
                        user_id
                    )));
                }
                guard = lock.lock_owned() => {
                    locks.guards.push(guard);
                    locks.user_ids.push(user_id);
                }
            }
        }

        tracing::trace!(users = ?locks.user_ids, "Acquired user locks");
        Ok(locks)
    }

    /// Acquire one throttle permit
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Cancelled("waiting for reasoning throttle".to_string()))
            }
            permit = self.throttle.clone().acquire_owned() => permit
                .map_err(|e| Error::Internal(format!("reasoning throttle closed: {}", e))),
        }
    }

    /// Run `call` while holding a throttle permit; the permit is released
    /// whether the call succeeds, fails or is cancelled.
    pub async fn throttled<F, T>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self.acquire_permit().await?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(Error::Cancelled("reasoning call".to_string()))
            }
            result = call => result,
        }
    }
}
