//! Example: Several in-process contenders sharing one lease lock
//!
//! Run with: `cargo run --example memory_locker`
//!
//! Three lockers contend for the same lock. Every few seconds the current
//! owner gives up, and another contender takes over once the lease lapses.
//! Press Ctrl-C to stop. Set `RUST_LOG=debug` to see renewals.

use lease_lock::*;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const TTL: Duration = Duration::from_secs(2);

async fn contend(
    storage: Arc<MemoryLockStorage>,
    name: String,
    shutdown: CancellationToken,
) -> LockResult<()> {
    for round in 1.. {
        // A fresh identity per round, so the old lease has to lapse first.
        let owner = format!("{name}/{round}");
        let locker = Locker::builder()
            .name("demo-lock")
            .owner(owner.clone())
            .ttl(TTL)
            .build(Arc::clone(&storage))?;

        let governing = shutdown.child_token();
        let mut sessions = locker.sessions(&governing).await?;
        let Some(session) = sessions.next().await else {
            return Ok(());
        };
        info!(%owner, session = session.sequence(), "working under lock");

        // Hold the lock for a while, then step aside and contend again.
        for step in 0..3 {
            let result = locker
                .execute_under_lock(session.token(), move |()| async move {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(step)
                })
                .await;
            match result {
                Ok(step) => info!(%owner, step, "step done"),
                Err(LockError::Cancelled) => break,
                Err(e) => return Err(e),
            }
        }

        info!(%owner, "stepping aside");
        locker.stop().await?;
        if shutdown.is_cancelled() {
            break;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let shutdown = CancellationToken::new();
    let storage = Arc::new(MemoryLockStorage::new());

    let mut contenders = Vec::new();
    for i in 1..=3 {
        contenders.push(tokio::spawn(contend(
            Arc::clone(&storage),
            format!("contender-{i}"),
            shutdown.clone(),
        )));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();

    for contender in contenders {
        contender.await??;
    }
    Ok(())
}
