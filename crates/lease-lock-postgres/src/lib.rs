//! PostgreSQL backend for lease locks.
//!
//! Each lock is a row `{lock_name, owner, deadline}` in a caller-chosen
//! table. Lease decisions are made by a single conditional `UPDATE` running
//! in a serializable transaction, so any number of processes can contend on
//! the same row.

pub mod connection;
pub mod schema;
pub mod storage;

pub use connection::PostgresConnection;
pub use schema::LockTableSchema;
pub use storage::{PostgresLockStorage, PostgresLockStorageBuilder};
