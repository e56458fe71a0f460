//! Session registry and heartbeat sweep
//!
//! The registry is the active-sessions index: every live WebSocket binds
//! exactly one session handle into it for the lifetime of the connection.
//! It is read-heavy (tick fan-out walks it every tick) and written only on
//! connect/disconnect, which is what the sharded map gives us.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use worldsync_core::{CloseReason, ServerFrame};

use crate::auth::{check_session, ValidatedSession};
use crate::state::AppState;
use crate::ServerError;

/// A frame on its way to one session.
///
/// Tick fan-out serialises one batch per permission class and shares the
/// bytes across every session in the class; everything else is enqueued as
/// a plain frame and serialised by the write task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(ServerFrame),
    Shared(Arc<str>),
    Pong(Vec<u8>),
}

/// One connected session.
pub struct SessionHandle {
    pub session_id: Uuid,
    pub agent_id: Uuid,
    /// Opaque transport token, kept so store calls can install identity
    pub token: String,
    /// Distinguishes this connection from a later rebind of the session
    pub connection_id: Uuid,

    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    last_seen: RwLock<Instant>,
    last_store_touch: RwLock<Instant>,
    close_reason: Mutex<Option<CloseReason>>,
}

impl SessionHandle {
    pub fn new(
        validated: ValidatedSession,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id: validated.session_id,
            agent_id: validated.agent_id,
            token: validated.token,
            connection_id: Uuid::new_v4(),
            outbound,
            cancel,
            last_seen: RwLock::new(now),
            last_store_touch: RwLock::new(now),
            close_reason: Mutex::new(None),
        }
    }

    /// Non-blocking enqueue. A full queue sheds the connection with 1011;
    /// the session itself stays valid and may reconnect.
    pub fn enqueue(&self, frame: ServerFrame) -> Result<(), ServerError> {
        self.enqueue_outbound(Outbound::Frame(frame))
    }

    /// Enqueue a pre-serialised batch shared across a permission class.
    pub fn enqueue_shared(&self, text: Arc<str>) -> Result<(), ServerError> {
        self.enqueue_outbound(Outbound::Shared(text))
    }

    /// Reply to a transport-level ping.
    pub fn enqueue_pong(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.enqueue_outbound(Outbound::Pong(data))
    }

    fn enqueue_outbound(&self, outbound: Outbound) -> Result<(), ServerError> {
        match self.outbound.try_send(outbound) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.close(CloseReason::Backpressure);
                Err(ServerError::Backpressure)
            }
            // Write task already gone; the frame has nowhere to go
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Request close with a reason. The first reason wins; the write task
    /// reads it when it drains out.
    pub fn close(&self, reason: CloseReason) {
        self.close_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Record client activity.
    pub fn mark_seen(&self) {
        *self.last_seen.write() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.read().elapsed()
    }

    /// Rate-limit store touches to once per heartbeat interval. Returns
    /// true when the caller should issue one and claims the slot.
    pub fn should_touch_store(&self, interval: Duration) -> bool {
        let mut last = self.last_store_touch.write();
        if last.elapsed() >= interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }
}

/// Active-sessions index, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handle, returning the handle it displaced (a stale connection
    /// for the same session) so the caller can close it.
    pub fn bind(&self, handle: Arc<SessionHandle>) -> Option<Arc<SessionHandle>> {
        self.sessions.insert(handle.session_id, handle)
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<SessionHandle>> {
        self.sessions.get(&session_id).map(|entry| entry.clone())
    }

    /// Remove a binding, but only if it still belongs to `connection_id`.
    /// A reconnect may have rebound the session already.
    pub fn unbind(&self, session_id: Uuid, connection_id: Uuid) -> bool {
        self.sessions
            .remove_if(&session_id, |_, handle| {
                handle.connection_id == connection_id
            })
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions.iter().map(|entry| entry.clone()).collect()
    }

    /// Close every connection (server shutdown).
    pub fn close_all(&self, reason: CloseReason) {
        for entry in self.sessions.iter() {
            entry.close(reason);
        }
    }
}

/// Spawn the heartbeat sweep.
///
/// Every `ws_check_interval` the sweep re-validates sessions that have been
/// idle longer than the interval. Validation failure closes the connection
/// with 1000; store trouble is retried on the next sweep rather than
/// evicting anyone.
pub fn spawn_heartbeat_sweep(state: AppState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = Duration::from_millis(state.settings.session.ws_check_interval_ms);
        let parallelism = state.settings.session.max_validation_parallelism;

        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = shutdown.cancelled() => {
                    tracing::info!("Heartbeat sweep shutting down");
                    break;
                }
            }

            let stale: Vec<Arc<SessionHandle>> = state
                .registry
                .handles()
                .into_iter()
                .filter(|handle| !handle.is_closed() && handle.idle_for() > interval)
                .collect();

            if stale.is_empty() {
                continue;
            }

            tracing::debug!(count = stale.len(), "Re-validating idle sessions");

            use futures::StreamExt;
            futures::stream::iter(stale)
                .for_each_concurrent(parallelism, |handle| {
                    let state = state.clone();
                    async move {
                        revalidate(&state, &handle).await;
                    }
                })
                .await;
        }
    })
}

async fn revalidate(state: &AppState, handle: &SessionHandle) {
    match state.store.fetch_session(handle.session_id).await {
        Ok(Some(row)) => {
            if let Err(reason) = check_session(&row, &handle.token) {
                tracing::info!(
                    session_id = %handle.session_id,
                    %reason,
                    "Idle session failed re-validation; closing"
                );
                handle.close(CloseReason::SessionExpired);
            }
        }
        Ok(None) => {
            tracing::info!(session_id = %handle.session_id, "Session vanished; closing");
            handle.close(CloseReason::SessionExpired);
        }
        Err(error) => {
            // Transient store trouble: keep the session, retry next sweep
            tracing::warn!(
                session_id = %handle.session_id,
                %error,
                "Heartbeat re-validation hit a store error; will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_with_capacity(capacity: usize) -> (Arc<SessionHandle>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let validated = ValidatedSession {
            session_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            token: "tok".to_string(),
        };
        (
            Arc::new(SessionHandle::new(validated, tx, CancellationToken::new())),
            rx,
        )
    }

    #[tokio::test]
    async fn test_enqueue_and_drain() {
        let (handle, mut rx) = handle_with_capacity(4);
        handle.enqueue(ServerFrame::HeartbeatAck).unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Frame(ServerFrame::HeartbeatAck) => {}
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overflow_closes_with_backpressure() {
        let (handle, _rx) = handle_with_capacity(1);

        handle.enqueue(ServerFrame::HeartbeatAck).unwrap();
        let err = handle.enqueue(ServerFrame::HeartbeatAck).unwrap_err();

        assert!(matches!(err, ServerError::Backpressure));
        assert!(handle.is_closed());
        assert_eq!(handle.close_reason(), Some(CloseReason::Backpressure));
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (handle, _rx) = handle_with_capacity(1);

        handle.close(CloseReason::SessionExpired);
        handle.close(CloseReason::Backpressure);

        assert_eq!(handle.close_reason(), Some(CloseReason::SessionExpired));
    }

    #[tokio::test]
    async fn test_registry_bind_displaces_stale_connection() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = handle_with_capacity(1);
        let session_id = first.session_id;

        assert!(registry.bind(first.clone()).is_none());

        // Rebind the same session from a new connection
        let (tx, _rx2) = mpsc::channel(1);
        let second = Arc::new(SessionHandle::new(
            ValidatedSession {
                session_id,
                agent_id: first.agent_id,
                token: "tok".to_string(),
            },
            tx,
            CancellationToken::new(),
        ));

        let displaced = registry.bind(second.clone()).unwrap();
        assert_eq!(displaced.connection_id, first.connection_id);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_registry_unbind_checks_connection_identity() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = handle_with_capacity(1);
        registry.bind(handle.clone());

        // A stale connection id must not remove the live binding
        assert!(!registry.unbind(handle.session_id, Uuid::new_v4()));
        assert_eq!(registry.len(), 1);

        assert!(registry.unbind(handle.session_id, handle.connection_id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_store_touch_rate_limit() {
        let (handle, _rx) = handle_with_capacity(1);
        let interval = Duration::from_secs(60);

        // The slot was claimed at construction time
        assert!(!handle.should_touch_store(interval));
        assert!(handle.should_touch_store(Duration::ZERO));
    }
}
