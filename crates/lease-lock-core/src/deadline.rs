//! Lease deadline register shared between the renewal loop and its readers.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};

/// Single-writer, multi-reader register holding the latest lease deadline.
///
/// The value is kept as Unix-epoch microseconds in an atomic so that readers
/// never block the renewal writer. Before the first successful renewal the
/// register holds no deadline.
///
/// Besides the deadline the register records whether the lease behind it was
/// declared over. The renewal writer and the session reader decide on the
/// same atomic word, so a renewal either lands before the lease is ended
/// (and continues it) or after (and starts a new one), never in between.
#[derive(Debug)]
pub struct DeadlineRegister {
    /// `micros << 1 | ended`, or `UNKNOWN`.
    raw: AtomicI64,
}

impl DeadlineRegister {
    const UNKNOWN: i64 = i64::MIN;
    const ENDED: i64 = 1;

    /// Creates an empty register.
    pub const fn new() -> Self {
        Self {
            raw: AtomicI64::new(Self::UNKNOWN),
        }
    }

    fn encode(deadline: DateTime<Utc>) -> i64 {
        deadline.timestamp_micros() << 1
    }

    fn decode(raw: i64) -> Option<DateTime<Utc>> {
        match raw {
            Self::UNKNOWN => None,
            raw => DateTime::from_timestamp_micros(raw >> 1),
        }
    }

    /// Publishes a new deadline.
    ///
    /// `Release` ordering makes the store visible to any task that later
    /// observes an event sent after it.
    pub fn store(&self, deadline: DateTime<Utc>) {
        self.raw.store(Self::encode(deadline), Ordering::Release);
    }

    /// Publishes a renewed deadline and reports whether it continues the
    /// previous lease.
    ///
    /// Returns `false` when there was no previous lease, when it was ended
    /// through [`end_if_expired`](Self::end_if_expired), or when its deadline
    /// had already passed at `now`.
    pub fn renew(&self, deadline: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let previous = self.raw.swap(Self::encode(deadline), Ordering::AcqRel);
        previous & Self::ENDED == 0
            && Self::decode(previous).is_some_and(|previous| now < previous)
    }

    /// Marks the lease as over if its deadline is at or before `now`.
    ///
    /// Returns `true` if the lease is over, either by this call or earlier.
    /// Returns `false` if a renewal moved the deadline past `now`.
    pub fn end_if_expired(&self, now: DateTime<Utc>) -> bool {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            if current == Self::UNKNOWN || current & Self::ENDED != 0 {
                return true;
            }
            if Self::decode(current).is_some_and(|deadline| now < deadline) {
                return false;
            }
            match self.raw.compare_exchange_weak(
                current,
                current | Self::ENDED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns the latest deadline, or `None` if no lease was ever held.
    pub fn load(&self) -> Option<DateTime<Utc>> {
        Self::decode(self.raw.load(Ordering::Acquire))
    }

    /// Returns `true` if `now` is at or past the deadline.
    ///
    /// An unknown deadline counts as already expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.load().is_none_or(|deadline| now >= deadline)
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> std::time::Duration {
        self.load()
            .and_then(|deadline| (deadline - now).to_std().ok())
            .unwrap_or_default()
    }
}

impl Default for DeadlineRegister {
    fn default() -> Self {
        Self::new()
    }
}
