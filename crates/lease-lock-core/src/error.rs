//! Error types for lease lock operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// An operation did not complete in time.
    #[error("lock operation timed out after {0:?}")]
    Timeout(Duration),

    /// The caller stopped waiting for the operation.
    #[error("lock operation was cancelled")]
    Cancelled,

    /// The caller is not the current owner of the lock.
    #[error("not the owner of lock '{name}' (owner: {owner})")]
    NotOwner {
        /// Lock name.
        name: String,
        /// Identity that asked to act as owner.
        owner: String,
    },

    /// The lock record does not exist in storage.
    #[error("lock record not found: {0}")]
    NotFound(String),

    /// The session stream of a locker was already handed out.
    #[error("locker for '{0}' is already started")]
    AlreadyStarted(String),

    /// The locker's background tasks are no longer running.
    #[error("locker for '{0}' is stopped")]
    Stopped(String),

    /// Invalid lock, table or column name.
    #[error("invalid lock name: {0}")]
    InvalidName(String),

    /// Invalid locker or storage configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Backend connection failed.
    #[error("connection error: {0}")]
    Connection(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Backend-specific error.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LockError {
    /// Wraps a backend failure described only by a message.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(Box::new(std::io::Error::other(message.into())))
    }

    /// Returns `true` for the ownership-denied condition.
    pub fn is_not_owner(&self) -> bool {
        matches!(self, Self::NotOwner { .. })
    }
}

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_owner_is_distinguished() {
        let err = LockError::NotOwner {
            name: "jobs".to_string(),
            owner: "worker-1".to_string(),
        };
        assert!(err.is_not_owner());
        assert_eq!(err.to_string(), "not the owner of lock 'jobs' (owner: worker-1)");
        assert!(!LockError::backend("boom").is_not_owner());
    }
}
