//! PostgreSQL connection management for lease locks.

use std::fmt;

use lease_lock_core::error::{LockError, LockResult};
use sqlx::PgPool;

/// Represents different ways to connect to PostgreSQL.
#[derive(Clone)]
pub enum PostgresConnection {
    /// Connect using a connection string. The storage owns the pool.
    ConnectionString(String),
    /// Use an existing connection pool.
    Pool(PgPool),
}

impl PostgresConnection {
    /// Get or create a connection pool.
    ///
    /// For the `ConnectionString` variant a new pool is connected; for the
    /// `Pool` variant the existing pool is cloned.
    pub async fn get_pool(&self) -> LockResult<PgPool> {
        match self {
            Self::ConnectionString(url) => PgPool::connect(url).await.map_err(|e| {
                LockError::Connection(Box::new(std::io::Error::other(format!(
                    "failed to connect to PostgreSQL: {e}"
                ))))
            }),
            Self::Pool(pool) => Ok(pool.clone()),
        }
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionString(_) => {
                write!(f, "PostgresConnection::ConnectionString([REDACTED])")
            }
            Self::Pool(_) => write!(f, "PostgresConnection::Pool([POOL])"),
        }
    }
}
