//! In-process lock storage.
//!
//! Implements the [`LockStorage`] semantics over a map guarded by a mutex. It
//! has no transaction concept: work executed under the lock receives `()` and
//! runs while the map is held, so no other lease operation on this storage
//! can interleave with it.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::{LockError, LockResult};
use crate::traits::{LockState, LockStorage};

#[derive(Debug, Clone, Default)]
struct LocalLock {
    owner: String,
    deadline: Option<DateTime<Utc>>,
}

/// Lock storage living in the memory of the current process.
///
/// Clones of a `MemoryLockStorage` are independent. Share one instance
/// between lockers through an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryLockStorage {
    locks: Mutex<HashMap<String, LocalLock>>,
}

impl MemoryLockStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state of `name`, if the record exists.
    pub async fn lock_state(&self, name: &str) -> Option<LockState> {
        self.locks
            .lock()
            .await
            .get(name)
            .map(|lock| LockState::new(lock.owner.clone(), lock.deadline))
    }

    fn ttl_delta(ttl: Duration) -> LockResult<chrono::TimeDelta> {
        chrono::TimeDelta::from_std(ttl)
            .map_err(|_| LockError::InvalidConfiguration(format!("ttl {ttl:?} is out of range")))
    }
}

impl LockStorage for MemoryLockStorage {
    type Transaction = ();

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn create_lock(&self, name: &str) -> LockResult<bool> {
        let mut locks = self.locks.lock().await;
        if locks.contains_key(name) {
            return Ok(false);
        }
        locks.insert(name.to_string(), LocalLock::default());
        Ok(true)
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> LockResult<LockState> {
        let ttl = Self::ttl_delta(ttl)?;
        let mut locks = self.locks.lock().await;
        let lock = locks
            .get_mut(name)
            .ok_or_else(|| LockError::NotFound(name.to_string()))?;

        let now = Utc::now();
        if lock.owner == owner {
            lock.deadline = Some(now + ttl);
        } else if lock.deadline.is_none_or(|deadline| now >= deadline) {
            debug!(previous_owner = %lock.owner, "lease transferred");
            lock.owner = owner.to_string();
            lock.deadline = Some(now + ttl);
        }

        Ok(LockState::new(lock.owner.clone(), lock.deadline))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn check_lock_owner(&self, name: &str, expected_owner: &str) -> LockResult<Option<()>> {
        let locks = self.locks.lock().await;
        let lock = locks
            .get(name)
            .ok_or_else(|| LockError::NotFound(name.to_string()))?;
        Ok(LockState::new(lock.owner.as_str(), lock.deadline)
            .is_owned_by(expected_owner)
            .then_some(()))
    }

    async fn execute_under_lock<F, Fut, T>(&self, name: &str, owner: &str, f: F) -> LockResult<T>
    where
        F: FnOnce(Self::Transaction) -> Fut + Send,
        Fut: Future<Output = LockResult<T>> + Send,
        T: Send,
    {
        let locks = self.locks.lock().await;
        let is_owner = locks
            .get(name)
            .is_some_and(|lock| !owner.is_empty() && lock.owner == owner);
        if !is_owner {
            return Err(LockError::NotOwner {
                name: name.to_string(),
                owner: owner.to_string(),
            });
        }

        let result = f(()).await;
        drop(locks);
        result
    }
}
