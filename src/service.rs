//! Transport-facing entry points: one call per turn, returning its event stream.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::delivery::{self, DeadLetterQueue, EventSender};
use crate::error::TurnError;
use crate::events::Event;
use crate::orchestrator::{FirstTurnRequest, FollowUpRequest, Orchestrator};
use crate::session::Session;

pub type EventStream = ReceiverStream<Event>;

/// One async mutex per session; a turn holds it from load to final save.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub async fn acquire(&self, session_id: Uuid) -> SessionGuard {
        let lock = self.inner.entry(session_id).or_default().clone();
        let guard = lock.lock_owned().await;
        SessionGuard { locks: self.clone(), session_id, guard: Some(guard) }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

pub struct SessionGuard {
    locks: SessionLocks,
    session_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // forget the lock once nobody else holds or waits on it
        self.locks
            .inner
            .remove_if(&self.session_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Run `turn`, cancelling it through `cancel` once `limit` has passed. The
/// turn still runs to its end so it can report the cancellation.
async fn with_deadline<T>(limit: Duration, cancel: &CancellationToken, turn: impl Future<Output = T>) -> T {
    tokio::pin!(turn);
    match tokio::time::timeout(limit, &mut turn).await {
        Ok(out) => out,
        Err(_) => {
            warn!(limit_ms = limit.as_millis() as u64, "turn deadline passed, cancelling");
            cancel.cancel();
            turn.await
        }
    }
}

#[derive(Clone)]
pub struct TurnService {
    orchestrator: Arc<Orchestrator>,
    dead_letters: DeadLetterQueue,
    locks: SessionLocks,
}

impl TurnService {
    pub fn new(orchestrator: Arc<Orchestrator>, dead_letters: DeadLetterQueue) -> Self {
        Self { orchestrator, dead_letters, locks: SessionLocks::default() }
    }

    fn sender(&self, session_id: Uuid, cancel: CancellationToken) -> (EventSender, EventStream) {
        let (tx, rx) = delivery::channel(self.orchestrator.config().delivery, cancel, self.dead_letters.clone());
        (tx.for_session(session_id), ReceiverStream::new(rx))
    }

    /// Start a new conversation. The stream ends after the turn's final event.
    pub fn run_first_turn(&self, request: FirstTurnRequest, cancel: CancellationToken) -> (Uuid, EventStream) {
        let session_id = Uuid::new_v4();
        let (tx, stream) = self.sender(session_id, cancel.clone());
        let orchestrator = self.orchestrator.clone();
        let locks = self.locks.clone();
        let limit = self.orchestrator.config().turn_timeout;
        tokio::spawn(async move {
            let turn = locks.acquire(session_id).await;
            let result = with_deadline(limit, &cancel, orchestrator.run_first_turn(session_id, request, &tx)).await;
            if let Err(e) = result {
                debug!(%session_id, kind = e.kind(), "first turn ended with error");
            }
            // release the session before the stream closes
            drop(turn);
            drop(tx);
        });
        (session_id, stream)
    }

    /// Run one follow-up turn; turns on the same session run one at a time.
    pub fn continue_turn(&self, session_id: Uuid, request: FollowUpRequest, cancel: CancellationToken) -> EventStream {
        let (tx, stream) = self.sender(session_id, cancel.clone());
        let orchestrator = self.orchestrator.clone();
        let locks = self.locks.clone();
        let limit = self.orchestrator.config().turn_timeout;
        tokio::spawn(async move {
            let turn = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(%session_id, "client left while waiting for the session");
                    return;
                }
                guard = locks.acquire(session_id) => guard,
            };
            let result = with_deadline(limit, &cancel, orchestrator.continue_turn(session_id, request, &tx)).await;
            if let Err(e) = result {
                debug!(%session_id, kind = e.kind(), "follow-up ended with error");
            }
            drop(turn);
            drop(tx);
        });
        stream
    }

    /// Current state of a session. An overdue session reports as expired.
    pub async fn session(&self, session_id: Uuid) -> Result<Session, TurnError> {
        let mut session = self
            .orchestrator
            .repository()
            .load_session(session_id)
            .await
            .map_err(TurnError::persistence)?
            .ok_or(TurnError::SessionNotFound(session_id))?;
        session.refresh_status(Utc::now());
        Ok(session)
    }

    /// Mark a session expired. Idempotent.
    pub async fn end_session(&self, session_id: Uuid) -> Result<Session, TurnError> {
        let _turn = self.locks.acquire(session_id).await;
        let repo = self.orchestrator.repository();
        let mut session = repo
            .load_session(session_id)
            .await
            .map_err(TurnError::persistence)?
            .ok_or(TurnError::SessionNotFound(session_id))?;
        session.end();
        repo.save_session(&session).await.map_err(TurnError::persistence)?;
        Ok(session)
    }
}
