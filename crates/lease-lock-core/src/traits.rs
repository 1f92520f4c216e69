//! Core traits for lease lock storage.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{LockError, LockResult};

// ============================================================================
// Lock State
// ============================================================================

/// Owner and deadline of a lock record as left by a conditional assign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockState {
    /// Current owner; empty when nobody ever held the lock.
    pub owner: String,
    /// Current lease deadline; `None` when the record was never leased.
    pub deadline: Option<DateTime<Utc>>,
}

impl LockState {
    /// Creates a lock state.
    pub fn new(owner: impl Into<String>, deadline: Option<DateTime<Utc>>) -> Self {
        Self {
            owner: owner.into(),
            deadline,
        }
    }

    /// Returns `true` if `owner` holds the lease described by this state.
    pub fn is_owned_by(&self, owner: &str) -> bool {
        !owner.is_empty() && self.owner == owner
    }
}

// ============================================================================
// Lock Storage Trait
// ============================================================================

/// Durable storage for lock records with an atomic conditional assign.
///
/// Each named lock is a single record `{name, owner, deadline}`. Records are
/// created once and afterwards only changed through [`try_lock`], which
/// implements the extend / transfer / no-op decision atomically against
/// concurrent callers in other processes.
///
/// Backends expose their transactional scope through [`Transaction`]. The
/// coordination code never looks inside it; it is handed to work executed
/// under the lock so that "still the owner" and "the work" commit together.
///
/// # Example
///
/// ```rust,ignore
/// let storage = MemoryLockStorage::new();
/// storage.create_lock("jobs").await?;
///
/// let state = storage.try_lock("jobs", "worker-1", Duration::from_secs(10)).await?;
/// assert!(state.is_owned_by("worker-1"));
///
/// storage
///     .execute_under_lock("jobs", "worker-1", |_tx| async move { run_job().await })
///     .await?;
/// ```
///
/// [`try_lock`]: LockStorage::try_lock
/// [`Transaction`]: LockStorage::Transaction
pub trait LockStorage: Send + Sync + 'static {
    /// Transaction handle passed to work executed under the lock.
    type Transaction: Send + 'static;

    /// Ensures a record for `name` exists with an empty owner.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The record was created by this call
    /// * `Ok(false)` - The record already existed
    /// * `Err(...)` - The backend failed
    fn create_lock(&self, name: &str) -> impl Future<Output = LockResult<bool>> + Send;

    /// Atomically extends, transfers or leaves the lease on `name`.
    ///
    /// Evaluated against the record at call time:
    ///
    /// * record owner equals `owner` - the deadline becomes `now + ttl`
    /// * `now >= deadline` (or no deadline) - ownership moves to `owner` and
    ///   the deadline becomes `now + ttl`
    /// * otherwise nothing changes
    ///
    /// The resulting owner and deadline are returned in every case, so the
    /// caller learns whether it holds the lease from the return value alone.
    fn try_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = LockResult<LockState>> + Send;

    /// Confirms that `expected_owner` holds `name`.
    ///
    /// The check runs inside the transaction that is returned on success. When
    /// the caller is not the owner the transaction is rolled back and `None`
    /// is returned.
    fn check_lock_owner(
        &self,
        name: &str,
        expected_owner: &str,
    ) -> impl Future<Output = LockResult<Option<Self::Transaction>>> + Send;

    /// Runs `f` inside the ownership-checked transaction.
    ///
    /// Fails with [`LockError::NotOwner`] without calling `f` if `owner` does
    /// not hold the lock.
    fn execute_under_lock<F, Fut, T>(
        &self,
        name: &str,
        owner: &str,
        f: F,
    ) -> impl Future<Output = LockResult<T>> + Send
    where
        F: FnOnce(Self::Transaction) -> Fut + Send,
        Fut: Future<Output = LockResult<T>> + Send,
        T: Send,
    {
        async move {
            match self.check_lock_owner(name, owner).await? {
                Some(tx) => f(tx).await,
                None => Err(LockError::NotOwner {
                    name: name.to_string(),
                    owner: owner.to_string(),
                }),
            }
        }
    }
}

impl<S: LockStorage> LockStorage for std::sync::Arc<S> {
    type Transaction = S::Transaction;

    fn create_lock(&self, name: &str) -> impl Future<Output = LockResult<bool>> + Send {
        (**self).create_lock(name)
    }

    fn try_lock(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = LockResult<LockState>> + Send {
        (**self).try_lock(name, owner, ttl)
    }

    fn check_lock_owner(
        &self,
        name: &str,
        expected_owner: &str,
    ) -> impl Future<Output = LockResult<Option<Self::Transaction>>> + Send {
        (**self).check_lock_owner(name, expected_owner)
    }

    fn execute_under_lock<F, Fut, T>(
        &self,
        name: &str,
        owner: &str,
        f: F,
    ) -> impl Future<Output = LockResult<T>> + Send
    where
        F: FnOnce(Self::Transaction) -> Fut + Send,
        Fut: Future<Output = LockResult<T>> + Send,
        T: Send,
    {
        (**self).execute_under_lock(name, owner, f)
    }
}
