//! Convenience prelude for lease lock types.

pub use crate::deadline::DeadlineRegister;
pub use crate::error::{LockError, LockResult};
pub use crate::memory::MemoryLockStorage;
pub use crate::traits::{LockState, LockStorage};
