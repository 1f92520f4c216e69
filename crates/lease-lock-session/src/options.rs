//! Locker configuration.

use std::marker::PhantomData;
use std::time::Duration;

use lease_lock_core::error::{LockError, LockResult};
use lease_lock_core::traits::LockStorage;

use crate::locker::Locker;

/// Settings for a [`Locker`].
#[derive(Debug, Clone)]
pub struct LockerOptions {
    /// Name of the lock record to contend for.
    pub name: String,
    /// Identity of this contender. Must be unique per competing process.
    pub owner: String,
    /// Lease length granted by each successful renewal.
    pub ttl: Duration,
    /// Maximum number of pending `execute_under_lock` work items.
    pub work_queue_capacity: usize,
}

impl LockerOptions {
    /// Shortest lease accepted by [`validate`](Self::validate).
    pub const MIN_TTL: Duration = Duration::from_millis(10);

    /// Creates options with the default lease settings.
    pub fn new(name: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            ..Self::default()
        }
    }

    /// Checks that the options describe a usable locker.
    pub fn validate(&self) -> LockResult<()> {
        if self.name.is_empty() {
            return Err(LockError::InvalidName("lock name cannot be empty".to_string()));
        }
        if self.owner.is_empty() {
            return Err(LockError::InvalidConfiguration(
                "owner cannot be empty".to_string(),
            ));
        }
        if self.ttl < Self::MIN_TTL {
            return Err(LockError::InvalidConfiguration(format!(
                "ttl must be at least {:?}, got {:?}",
                Self::MIN_TTL,
                self.ttl
            )));
        }
        if self.work_queue_capacity == 0 {
            return Err(LockError::InvalidConfiguration(
                "work queue capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Range the jittered renewal interval is drawn from: `[ttl/10, ttl/5)`.
    pub fn renewal_interval_range(&self) -> (Duration, Duration) {
        (self.ttl / 10, self.ttl / 5)
    }
}

impl Default for LockerOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            owner: String::new(),
            ttl: Duration::from_secs(10),
            work_queue_capacity: 16,
        }
    }
}

/// Builder for [`Locker`] configuration.
///
/// The storage type is fixed by the value passed to [`build`](Self::build).
pub struct LockerBuilder<S> {
    options: LockerOptions,
    _storage: PhantomData<fn() -> S>,
}

impl<S> LockerBuilder<S> {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            options: LockerOptions::default(),
            _storage: PhantomData,
        }
    }

    /// The options collected so far.
    pub fn options(&self) -> &LockerOptions {
        &self.options
    }

    /// Sets the lock name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = name.into();
        self
    }

    /// Sets the owner identity.
    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.options.owner = owner.into();
        self
    }

    /// Sets the lease length.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = ttl;
        self
    }

    /// Sets how many work items may wait for the renewal loop.
    pub fn work_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.work_queue_capacity = capacity;
        self
    }

    /// Builds a locker over `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options do not pass
    /// [`LockerOptions::validate`].
    pub fn build(self, storage: S) -> LockResult<Locker<S>>
    where
        S: LockStorage,
    {
        Locker::new(storage, self.options)
    }
}

impl<S> Default for LockerBuilder<S> {
    fn default() -> Self {
        Self::new()
    }
}
