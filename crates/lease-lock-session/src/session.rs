//! Lock sessions and the controller that derives them from lease state.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use lease_lock_core::deadline::DeadlineRegister;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

// ============================================================================
// Lock Session
// ============================================================================

/// One continuous period of confirmed lock ownership.
///
/// A session is valid until its token is cancelled. That happens at the
/// latest when the lease deadline passes without renewal, and also when the
/// locker's governing token is cancelled or a newer session replaces it.
///
/// # Example
///
/// ```rust,ignore
/// while let Some(session) = sessions.next().await {
///     while !session.is_cancelled() {
///         do_work_step().await;
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct LockSession {
    token: CancellationToken,
    name: Arc<str>,
    owner: Arc<str>,
    sequence: u64,
    started_at: DateTime<Utc>,
    deadline: Arc<DeadlineRegister>,
}

impl LockSession {
    /// Cancellation token scoping this session.
    ///
    /// Child tokens derived from it end no later than the session.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns `true` once the session is no longer valid.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the session ends.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Runs `future` unless the session ends first.
    ///
    /// Returns `None` if the session ended before `future` completed.
    pub async fn run<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => None,
            output = future => Some(output),
        }
    }

    /// Name of the held lock.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner identity holding the lock.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Position of this session among the sessions of its locker, from 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// When ownership was observed.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Latest known lease deadline. Moves forward as renewals succeed.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline.load()
    }
}

// ============================================================================
// Session Stream
// ============================================================================

/// Stream of lock sessions produced by a locker.
///
/// Yields a fresh session after every acquisition. Ends when the locker's
/// governing token is cancelled; this means ownership was abandoned and is
/// not an error.
#[derive(Debug)]
pub struct Sessions {
    rx: mpsc::UnboundedReceiver<LockSession>,
}

impl Sessions {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<LockSession>) -> Self {
        Self { rx }
    }

    /// Waits for the next live session.
    ///
    /// Sessions that already ended before being picked up are skipped.
    pub async fn next(&mut self) -> Option<LockSession> {
        loop {
            let session = self.rx.recv().await?;
            if !session.is_cancelled() {
                return Some(session);
            }
        }
    }
}

impl Stream for Sessions {
    type Item = LockSession;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(session)) if session.is_cancelled() => continue,
                other => return other,
            }
        }
    }
}

// ============================================================================
// Session Controller
// ============================================================================

/// Turns acquisition events and the deadline register into sessions.
pub(crate) struct SessionController {
    name: Arc<str>,
    owner: Arc<str>,
    deadline: Arc<DeadlineRegister>,
    acquired_rx: mpsc::Receiver<()>,
    sessions_tx: mpsc::UnboundedSender<LockSession>,
    current: Option<CancellationToken>,
    sequence: u64,
}

impl SessionController {
    pub(crate) fn new(
        name: &str,
        owner: &str,
        deadline: Arc<DeadlineRegister>,
        acquired_rx: mpsc::Receiver<()>,
        sessions_tx: mpsc::UnboundedSender<LockSession>,
    ) -> Self {
        Self {
            name: Arc::from(name),
            owner: Arc::from(owner),
            deadline,
            acquired_rx,
            sessions_tx,
            current: None,
            sequence: 0,
        }
    }

    /// Runs until `cancel` fires or the renewal loop goes away.
    ///
    /// Dropping the controller closes the session stream.
    pub(crate) async fn run(mut self, cancel: CancellationToken) {
        let expiry = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(expiry);
        let mut armed = false;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = self.acquired_rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    self.begin_session(&cancel);
                    expiry
                        .as_mut()
                        .reset(Instant::now() + self.deadline.remaining_at(Utc::now()));
                    armed = true;
                }
                () = &mut expiry, if armed => {
                    let now = Utc::now();
                    if self.deadline.end_if_expired(now) {
                        self.end_session();
                        armed = false;
                    } else {
                        // Renewed since the timer was armed.
                        expiry
                            .as_mut()
                            .reset(Instant::now() + self.deadline.remaining_at(now));
                    }
                }
            }
        }

        if let Some(token) = self.current.take() {
            token.cancel();
        }
        debug!(lock.name = %self.name, lock.owner = %self.owner, "session controller stopped");
    }

    fn begin_session(&mut self, cancel: &CancellationToken) {
        if let Some(previous) = self.current.take() {
            previous.cancel();
        }

        self.sequence += 1;
        let token = cancel.child_token();
        let session = LockSession {
            token: token.clone(),
            name: Arc::clone(&self.name),
            owner: Arc::clone(&self.owner),
            sequence: self.sequence,
            started_at: Utc::now(),
            deadline: Arc::clone(&self.deadline),
        };
        self.current = Some(token);

        info!(
            lock.name = %self.name,
            lock.owner = %self.owner,
            session = self.sequence,
            deadline = ?self.deadline.load(),
            "lock session started"
        );
        // Nobody listening is fine; work items still run on the renewal loop.
        let _ = self.sessions_tx.send(session);
    }

    fn end_session(&mut self) {
        if let Some(token) = self.current.take() {
            info!(
                lock.name = %self.name,
                lock.owner = %self.owner,
                session = self.sequence,
                "lease expired, lock session cancelled"
            );
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    struct Harness {
        deadline: Arc<DeadlineRegister>,
        acquired_tx: mpsc::Sender<()>,
        sessions: Sessions,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn start_controller() -> Harness {
        let deadline = Arc::new(DeadlineRegister::new());
        let (acquired_tx, acquired_rx) = mpsc::channel(1);
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let controller = SessionController::new(
            "jobs",
            "worker-1",
            Arc::clone(&deadline),
            acquired_rx,
            sessions_tx,
        );
        let task = tokio::spawn(controller.run(cancel.clone()));
        Harness {
            deadline,
            acquired_tx,
            sessions: Sessions::new(sessions_rx),
            cancel,
            task,
        }
    }

    fn deadline_in(millis: i64) -> DateTime<Utc> {
        Utc::now() + TimeDelta::milliseconds(millis)
    }

    #[tokio::test]
    async fn test_session_cancelled_when_deadline_passes() {
        let mut h = start_controller();
        h.deadline.store(deadline_in(100));
        h.acquired_tx.send(()).await.unwrap();

        let session = h.sessions.next().await.unwrap();
        assert_eq!(session.sequence(), 1);
        assert_eq!(session.name(), "jobs");
        assert_eq!(session.owner(), "worker-1");
        assert!(!session.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), session.cancelled())
            .await
            .expect("session should end at the deadline");
        assert!(Utc::now() >= session.deadline().unwrap());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_session_survives_extended_deadline() {
        let mut h = start_controller();
        h.deadline.store(deadline_in(100));
        h.acquired_tx.send(()).await.unwrap();
        let session = h.sessions.next().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        h.deadline.store(deadline_in(300));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_cancelled(), "renewed session ended early");

        tokio::time::timeout(Duration::from_secs(1), session.cancelled())
            .await
            .expect("session should end at the extended deadline");

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_new_acquisition_replaces_live_session() {
        let mut h = start_controller();
        h.deadline.store(deadline_in(5_000));
        h.acquired_tx.send(()).await.unwrap();
        let first = h.sessions.next().await.unwrap();

        h.acquired_tx.send(()).await.unwrap();
        let second = h.sessions.next().await.unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(second.sequence(), 2);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_ends_session_and_stream() {
        let mut h = start_controller();
        h.deadline.store(deadline_in(5_000));
        h.acquired_tx.send(()).await.unwrap();
        let session = h.sessions.next().await.unwrap();

        h.cancel.cancel();
        h.task.await.unwrap();

        assert!(session.is_cancelled());
        assert!(h.sessions.next().await.is_none());
    }

    #[tokio::test]
    async fn test_closed_event_channel_stops_controller() {
        let Harness {
            deadline,
            acquired_tx,
            mut sessions,
            task,
            ..
        } = start_controller();
        deadline.store(deadline_in(5_000));
        acquired_tx.send(()).await.unwrap();
        let session = sessions.next().await.unwrap();

        drop(acquired_tx);
        task.await.unwrap();

        assert!(session.is_cancelled());
        assert!(sessions.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_skips_replaced_sessions() {
        use futures::StreamExt;

        let mut h = start_controller();
        h.deadline.store(deadline_in(5_000));
        h.acquired_tx.send(()).await.unwrap();
        h.acquired_tx.send(()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let session = StreamExt::next(&mut h.sessions).await.unwrap();
        assert_eq!(session.sequence(), 2);
        assert!(!session.is_cancelled());

        h.cancel.cancel();
        h.task.await.unwrap();
        assert!(session.is_cancelled());
        assert!(StreamExt::next(&mut h.sessions).await.is_none());
    }

    #[tokio::test]
    async fn test_late_renewal_after_expiry_is_a_new_acquisition() {
        let mut h = start_controller();
        let deadline = deadline_in(50);
        h.deadline.store(deadline);
        h.acquired_tx.send(()).await.unwrap();
        let first = h.sessions.next().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), first.cancelled())
            .await
            .expect("session should end at the deadline");
        // The renewal attempt started before the deadline but lands after
        // the session was ended.
        assert!(!h.deadline.renew(deadline_in(5_000), deadline));

        h.acquired_tx.send(()).await.unwrap();
        let second = h.sessions.next().await.unwrap();
        assert_eq!(second.sequence(), 2);
        assert!(!second.is_cancelled());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_at_session_end() {
        let mut h = start_controller();
        h.deadline.store(deadline_in(50));
        h.acquired_tx.send(()).await.unwrap();
        let session = h.sessions.next().await.unwrap();

        let finished = session.run(tokio::time::sleep(Duration::from_secs(5))).await;
        assert!(finished.is_none());
        assert_eq!(session.run(async { 3 }).await, None);

        h.cancel.cancel();
        h.task.await.unwrap();
    }
}
