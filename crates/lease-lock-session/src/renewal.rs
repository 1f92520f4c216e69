//! Background lease renewal.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use lease_lock_core::deadline::DeadlineRegister;
use lease_lock_core::error::LockResult;
use lease_lock_core::traits::LockStorage;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Unit of work run on the renewal loop, strictly between renewal attempts.
pub(crate) type WorkItem = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Draws the next renewal delay uniformly from `[ttl/10, ttl/5)`.
///
/// Spreading the attempts of many contenders keeps them from hitting the
/// conditional assign in lockstep, while still renewing several times per
/// lease.
pub(crate) fn jittered_interval(ttl: Duration) -> Duration {
    let min = (ttl / 10).as_nanos() as u64;
    let max = (ttl / 5).as_nanos() as u64;
    if max <= min {
        return Duration::from_nanos(min);
    }
    Duration::from_nanos(rand::thread_rng().gen_range(min..max))
}

/// Periodically tries to become or stay the owner of one lock record.
pub(crate) struct RenewalLoop<S> {
    storage: Arc<S>,
    name: String,
    owner: String,
    ttl: Duration,
    deadline: Arc<DeadlineRegister>,
    acquired_tx: mpsc::Sender<()>,
    work_rx: mpsc::Receiver<WorkItem>,
    is_acquired: bool,
}

impl<S: LockStorage> RenewalLoop<S> {
    pub(crate) fn new(
        storage: Arc<S>,
        name: String,
        owner: String,
        ttl: Duration,
        deadline: Arc<DeadlineRegister>,
        acquired_tx: mpsc::Sender<()>,
        work_rx: mpsc::Receiver<WorkItem>,
    ) -> Self {
        Self {
            storage,
            name,
            owner,
            ttl,
            deadline,
            acquired_tx,
            work_rx,
            is_acquired: false,
        }
    }

    /// Ensures the lock record exists. The loop cannot run without it.
    pub(crate) async fn prepare(&self) -> LockResult<()> {
        match self.storage.create_lock(&self.name).await {
            Ok(true) => {
                info!(lock.name = %self.name, "lock record created");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                error!(lock.name = %self.name, error = %e, "failed to create lock record");
                Err(e)
            }
        }
    }

    /// Gives the work queue back when the loop is not going to run.
    pub(crate) fn into_work_queue(self) -> mpsc::Receiver<WorkItem> {
        self.work_rx
    }

    /// Runs until `cancel` fires.
    ///
    /// The first renewal attempt happens before any queued work item runs.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(lock.name = %self.name, lock.owner = %self.owner, "renewal loop stopped");
                return;
            }
            () = self.renew() => {}
        }
        let renew_at = tokio::time::sleep(jittered_interval(self.ttl));
        tokio::pin!(renew_at);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                () = &mut renew_at => {
                    self.renew().await;
                    renew_at
                        .as_mut()
                        .reset(Instant::now() + jittered_interval(self.ttl));
                }
                Some(item) = self.work_rx.recv() => item().await,
            }
        }

        debug!(lock.name = %self.name, lock.owner = %self.owner, "renewal loop stopped");
    }

    async fn renew(&mut self) {
        let state = match self.storage.try_lock(&self.name, &self.owner, self.ttl).await {
            Ok(state) => state,
            Err(e) => {
                warn!(lock.name = %self.name, error = %e, "lease renewal attempt failed");
                return;
            }
        };

        let deadline = match state.deadline {
            Some(deadline) if state.is_owned_by(&self.owner) => deadline,
            _ => {
                if self.is_acquired {
                    info!(lock.name = %self.name, current_owner = %state.owner, "lock ownership lost");
                }
                self.is_acquired = false;
                return;
            }
        };

        // A lease that lapsed or whose session was already ended is not
        // continued by this renewal, so winning it again is a fresh acquisition.
        let continued = self.deadline.renew(deadline, Utc::now());
        let was_held = self.is_acquired && continued;
        self.is_acquired = true;

        if was_held {
            debug!(lock.name = %self.name, %deadline, "lease renewed");
            return;
        }

        info!(lock.name = %self.name, lock.owner = %self.owner, %deadline, "lock acquired");
        // A full buffer already carries an undelivered acquisition.
        let _ = self.acquired_tx.try_send(());
    }
}
