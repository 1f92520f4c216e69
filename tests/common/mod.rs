//! Shared helpers for integration tests.

#![allow(dead_code)]

pub mod flaky_storage;

use std::time::Duration;

use lease_lock_session::{LockSession, Sessions};

/// Installs a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Waits for the next session, failing the test after `within`.
pub async fn next_session(sessions: &mut Sessions, within: Duration) -> LockSession {
    tokio::time::timeout(within, sessions.next())
        .await
        .expect("timed out waiting for a lock session")
        .expect("session stream ended")
}
