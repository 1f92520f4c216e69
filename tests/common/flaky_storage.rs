//! Lock storage with switchable failures.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use lease_lock_core::error::{LockError, LockResult};
use lease_lock_core::memory::MemoryLockStorage;
use lease_lock_core::traits::{LockState, LockStorage};

/// Wraps a [`MemoryLockStorage`] and fails on demand.
///
/// Clones share the same flags and records.
#[derive(Clone, Default)]
pub struct FlakyStorage {
    inner: Arc<MemoryLockStorage>,
    fail_create: Arc<AtomicBool>,
    fail_leases: Arc<AtomicBool>,
    try_lock_calls: Arc<AtomicUsize>,
    stall_lead: Arc<Mutex<Option<Duration>>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryLockStorage {
        &self.inner
    }

    /// Makes `create_lock` fail while set.
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Makes `try_lock` and `check_lock_owner` fail while set.
    pub fn fail_leases(&self, fail: bool) {
        self.fail_leases.store(fail, Ordering::SeqCst);
    }

    /// Holds the next `try_lock` until `lead` before the stored deadline.
    pub fn stall_next_lease(&self, lead: Duration) {
        *self.stall_lead.lock().unwrap() = Some(lead);
    }

    pub fn try_lock_calls(&self) -> usize {
        self.try_lock_calls.load(Ordering::SeqCst)
    }

    fn injected() -> LockError {
        LockError::backend("injected storage failure")
    }
}

impl LockStorage for FlakyStorage {
    type Transaction = ();

    async fn create_lock(&self, name: &str) -> LockResult<bool> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.create_lock(name).await
    }

    async fn try_lock(&self, name: &str, owner: &str, ttl: Duration) -> LockResult<LockState> {
        self.try_lock_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_leases.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        let lead = self.stall_lead.lock().unwrap().take();
        if let Some(lead) = lead {
            let deadline = self.inner.lock_state(name).await.and_then(|state| state.deadline);
            if let Some(deadline) = deadline {
                let wait = (deadline - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait.saturating_sub(lead)).await;
            }
        }
        self.inner.try_lock(name, owner, ttl).await
    }

    async fn check_lock_owner(&self, name: &str, expected_owner: &str) -> LockResult<Option<()>> {
        if self.fail_leases.load(Ordering::SeqCst) {
            return Err(Self::injected());
        }
        self.inner.check_lock_owner(name, expected_owner).await
    }
}
