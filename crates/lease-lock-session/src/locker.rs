//! The locker: public entry point tying storage, renewal and sessions together.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use lease_lock_core::deadline::DeadlineRegister;
use lease_lock_core::error::{LockError, LockResult};
use lease_lock_core::traits::LockStorage;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, info_span, instrument};

use crate::options::{LockerBuilder, LockerOptions};
use crate::renewal::{RenewalLoop, WorkItem};
use crate::session::{SessionController, Sessions};

enum LockerState {
    /// Not started yet; work items queue up until the renewal loop runs.
    Idle { work_rx: mpsc::Receiver<WorkItem> },
    Running {
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// A contender for one named lease lock.
///
/// The locker drives a renewal loop that keeps trying to obtain or extend
/// the lease, and a session controller that turns ownership into a stream of
/// [`LockSession`](crate::LockSession)s. Both run as tokio tasks started by
/// the first call to [`sessions`](Self::sessions).
///
/// # Example
///
/// ```rust,ignore
/// let locker = Locker::builder()
///     .name("nightly-report")
///     .owner(uuid::Uuid::new_v4().to_string())
///     .ttl(Duration::from_secs(10))
///     .build(storage)?;
///
/// let mut sessions = locker.sessions(&shutdown).await?;
/// while let Some(session) = sessions.next().await {
///     while !session.is_cancelled() {
///         locker
///             .execute_under_lock(session.token(), |tx| async move { write_report(tx).await })
///             .await?;
///     }
/// }
/// ```
pub struct Locker<S: LockStorage> {
    storage: Arc<S>,
    options: LockerOptions,
    deadline: Arc<DeadlineRegister>,
    work_tx: mpsc::Sender<WorkItem>,
    state: Mutex<LockerState>,
}

impl<S: LockStorage> Locker<S> {
    /// Creates a locker over `storage`.
    ///
    /// # Errors
    ///
    /// Returns an error if `options` are invalid.
    pub fn new(storage: S, options: LockerOptions) -> LockResult<Self> {
        options.validate()?;
        let (work_tx, work_rx) = mpsc::channel(options.work_queue_capacity);
        Ok(Self {
            storage: Arc::new(storage),
            options,
            deadline: Arc::new(DeadlineRegister::new()),
            work_tx,
            state: Mutex::new(LockerState::Idle { work_rx }),
        })
    }

    /// Returns a new builder for configuring a locker.
    pub fn builder() -> LockerBuilder<S> {
        LockerBuilder::new()
    }

    /// Name of the contended lock.
    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Owner identity of this locker.
    pub fn owner(&self) -> &str {
        &self.options.owner
    }

    /// Lease length requested on every renewal.
    pub fn ttl(&self) -> Duration {
        self.options.ttl
    }

    /// The storage this locker contends on.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Latest lease deadline won by this locker, if any.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline.load()
    }

    /// Returns `true` while this locker holds an unexpired lease.
    pub fn is_owner(&self) -> bool {
        !self.deadline.is_expired_at(Utc::now())
    }

    /// Starts contending for the lock and returns the session stream.
    ///
    /// The renewal loop and session controller run until `cancel` is
    /// cancelled or [`stop`](Self::stop) is called. Cancellation ends the
    /// live session and then the stream.
    ///
    /// # Errors
    ///
    /// * `LockError::AlreadyStarted` - The stream was already handed out
    /// * `LockError::Stopped` - The locker was stopped
    /// * any storage error from creating the lock record; the locker stays
    ///   idle and the call can be retried
    #[instrument(skip_all, fields(lock.name = %self.options.name, lock.owner = %self.options.owner))]
    pub async fn sessions(&self, cancel: &CancellationToken) -> LockResult<Sessions> {
        let mut state = self.state.lock().await;
        let work_rx = match std::mem::replace(&mut *state, LockerState::Stopped) {
            LockerState::Idle { work_rx } => work_rx,
            LockerState::Running { cancel, tasks } => {
                let err = if cancel.is_cancelled() {
                    LockError::Stopped(self.options.name.clone())
                } else {
                    LockError::AlreadyStarted(self.options.name.clone())
                };
                *state = LockerState::Running { cancel, tasks };
                return Err(err);
            }
            LockerState::Stopped => return Err(LockError::Stopped(self.options.name.clone())),
        };

        let (acquired_tx, acquired_rx) = mpsc::channel(1);
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();

        let renewal = RenewalLoop::new(
            Arc::clone(&self.storage),
            self.options.name.clone(),
            self.options.owner.clone(),
            self.options.ttl,
            Arc::clone(&self.deadline),
            acquired_tx,
            work_rx,
        );
        if let Err(e) = renewal.prepare().await {
            *state = LockerState::Idle {
                work_rx: renewal.into_work_queue(),
            };
            return Err(e);
        }

        let controller = SessionController::new(
            &self.options.name,
            &self.options.owner,
            Arc::clone(&self.deadline),
            acquired_rx,
            sessions_tx,
        );

        let token = cancel.child_token();
        let span = Span::current();
        let tasks = vec![
            tokio::spawn(
                renewal
                    .run(token.clone())
                    .instrument(info_span!(parent: &span, "renewal_loop")),
            ),
            tokio::spawn(
                controller
                    .run(token.clone())
                    .instrument(info_span!(parent: &span, "session_controller")),
            ),
        ];
        *state = LockerState::Running {
            cancel: token,
            tasks,
        };

        Ok(Sessions::new(sessions_rx))
    }

    /// Runs `f` with the storage transaction if this locker still owns the
    /// lock when the work item gets its turn.
    ///
    /// The work is queued on the renewal loop, so it never overlaps with a
    /// renewal attempt or with other work from this locker. Ownership is
    /// re-checked inside the storage transaction handed to `f`.
    ///
    /// Work queued before [`sessions`](Self::sessions) waits until the
    /// locker is started.
    ///
    /// # Errors
    ///
    /// * `LockError::NotOwner` - This locker does not hold the lock
    /// * `LockError::Cancelled` - `cancel` fired before the work finished;
    ///   work that has not started yet is skipped
    /// * `LockError::Stopped` - The locker stopped before running the work
    /// * any error from storage or from `f`
    pub async fn execute_under_lock<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        f: F,
    ) -> LockResult<T>
    where
        F: FnOnce(S::Transaction) -> Fut + Send + 'static,
        Fut: Future<Output = LockResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let storage = Arc::clone(&self.storage);
        let name = self.options.name.clone();
        let owner = self.options.owner.clone();
        let caller = cancel.clone();

        let item: WorkItem = Box::new(move || {
            async move {
                if caller.is_cancelled() || result_tx.is_closed() {
                    return;
                }
                let result = storage.execute_under_lock(&name, &owner, f).await;
                let _ = result_tx.send(result);
            }
            .boxed()
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LockError::Cancelled),
            sent = self.work_tx.send(item) => {
                sent.map_err(|_| LockError::Stopped(self.options.name.clone()))?;
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LockError::Cancelled),
            result = result_rx => {
                result.unwrap_or_else(|_| Err(LockError::Stopped(self.options.name.clone())))
            }
        }
    }

    /// Stops the background tasks and waits for them to finish.
    ///
    /// The live session is cancelled and the session stream ends. Pending
    /// and future work items fail with `LockError::Stopped`.
    pub async fn stop(&self) -> LockResult<()> {
        let mut state = self.state.lock().await;
        if let LockerState::Running { cancel, tasks } =
            std::mem::replace(&mut *state, LockerState::Stopped)
        {
            cancel.cancel();
            for task in tasks {
                task.await.map_err(|e| LockError::Backend(Box::new(e)))?;
            }
        }
        Ok(())
    }
}

impl<S: LockStorage> std::fmt::Debug for Locker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("name", &self.options.name)
            .field("owner", &self.options.owner)
            .field("ttl", &self.options.ttl)
            .field("deadline", &self.deadline.load())
            .finish_non_exhaustive()
    }
}

impl<S: LockStorage> Drop for Locker<S> {
    fn drop(&mut self) {
        if let LockerState::Running { cancel, .. } = self.state.get_mut() {
            cancel.cancel();
        }
    }
}
