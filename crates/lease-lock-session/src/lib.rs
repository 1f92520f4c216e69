//! Lease renewal and lock sessions.
//!
//! A [`Locker`] contends for one named lock on a
//! [`LockStorage`](lease_lock_core::LockStorage). While it holds the lease it
//! hands out [`LockSession`]s whose cancellation tokens fire no later than
//! the lease deadline.

mod locker;
mod options;
mod renewal;
mod session;

pub use locker::Locker;
pub use options::{LockerBuilder, LockerOptions};
pub use session::{LockSession, Sessions};
