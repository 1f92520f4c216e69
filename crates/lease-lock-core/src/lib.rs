//! Core traits and types for lease-based distributed locks.

pub mod deadline;
pub mod error;
pub mod memory;
pub mod prelude;
pub mod traits;

pub use error::{LockError, LockResult};
pub use prelude::*;
