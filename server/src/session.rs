//! Per-connection session state
//!
//! A session owns its egress queue sender and the mutable per-connection
//! state (worker, authorization, share target, hardware class). The inbound
//! decoder and outbound pusher tasks both hold the `Arc<Session>`; closing
//! is signalled exactly once regardless of which side initiates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use log::trace;
use tokio::sync::{mpsc, Notify};

use orepool_core::{ConnectionId, HardwareClass, ProtocolVariant};
use orepool_util::now_unix;

use crate::{DisconnectReason, ServerError};

/// Mutable session attributes, guarded by one mutex
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Worker label; non-empty once authorized
    pub worker: Option<String>,

    /// Whether mining.authorize (or its V2 equivalent) succeeded
    pub authorized: bool,

    /// Whether the peer completed mining.subscribe (V1 only)
    pub subscribed: bool,

    /// Current share target in difficulty units
    pub share_target: u64,

    /// Hardware class driving vardiff bounds
    pub hardware: HardwareClass,

    /// Declared user agent, when the peer sent one
    pub user_agent: Option<String>,

    /// V2 channel id once a channel is open
    pub channel_id: Option<u32>,
}

/// One connected mining device
pub struct Session {
    id: ConnectionId,
    remote_addr: SocketAddr,
    variant: ProtocolVariant,

    /// Server-assigned extranonce1, fixed for the connection unless rotated
    extranonce1: Mutex<Vec<u8>>,

    /// Subscription id reported to V1 clients
    subscription_id: String,

    state: Mutex<SessionState>,

    /// Unix seconds of last inbound activity; monotonically non-decreasing
    last_activity: AtomicU64,

    egress: mpsc::Sender<Bytes>,

    closed: AtomicBool,
    close_reason: Mutex<Option<DisconnectReason>>,
    close_notify: Notify,

    /// Per-session share outcomes
    pub accepted_shares: AtomicU64,
    pub rejected_shares: AtomicU64,
}

impl Session {
    /// Create a session and the receiver its outbound pusher will drain
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        variant: ProtocolVariant,
        extranonce1: Vec<u8>,
        egress_capacity: usize,
    ) -> (std::sync::Arc<Session>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(egress_capacity.max(1));
        let subscription_id = format!("{:016x}", rand::random::<u64>());
        let profile = HardwareClass::Unknown.profile();

        let session = Session {
            id,
            remote_addr,
            variant,
            extranonce1: Mutex::new(extranonce1),
            subscription_id,
            state: Mutex::new(SessionState {
                worker: None,
                authorized: false,
                subscribed: false,
                share_target: profile.baseline_target,
                hardware: HardwareClass::Unknown,
                user_agent: None,
                channel_id: None,
            }),
            last_activity: AtomicU64::new(now_unix()),
            egress: tx,
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            close_notify: Notify::new(),
            accepted_shares: AtomicU64::new(0),
            rejected_shares: AtomicU64::new(0),
        };
        (std::sync::Arc::new(session), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn variant(&self) -> ProtocolVariant {
        self.variant
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn extranonce1(&self) -> Vec<u8> {
        self.extranonce1.lock().unwrap().clone()
    }

    /// Replace the extranonce1, returning the new value for notification
    pub fn rotate_extranonce1(&self, extranonce1: Vec<u8>) -> Vec<u8> {
        *self.extranonce1.lock().unwrap() = extranonce1.clone();
        extranonce1
    }

    /// Run a closure against the locked mutable state
    pub fn with_state<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Snapshot of the mutable state
    pub fn state_snapshot(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.state.lock().unwrap().authorized
    }

    /// Worker label when authorized
    pub fn worker(&self) -> Option<String> {
        self.state.lock().unwrap().worker.clone()
    }

    pub fn share_target(&self) -> u64 {
        self.state.lock().unwrap().share_target
    }

    /// Mark authorization with a non-empty worker label
    pub fn authorize(&self, worker: &str) {
        debug_assert!(!worker.is_empty());
        let mut state = self.state.lock().unwrap();
        state.worker = Some(worker.to_string());
        state.authorized = true;
    }

    /// Refresh the last-activity stamp; never moves backwards
    pub fn touch(&self) {
        let now = now_unix();
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    /// How long the session has been silent
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        Duration::from_secs(now_unix().saturating_sub(last))
    }

    /// Queue bytes for the outbound pusher without blocking.
    ///
    /// A full queue is the slow-consumer signal: the caller must close the
    /// session rather than wait.
    pub fn send(&self, payload: Bytes) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::SessionClosed);
        }
        match self.egress.try_send(payload) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(ServerError::EgressFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ServerError::SessionClosed),
        }
    }

    /// Signal close exactly once; later calls keep the original reason
    pub fn close(&self, reason: DisconnectReason) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            trace!("{} closing: {}", self.id, reason);
            *self.close_reason.lock().unwrap() = Some(reason);
            self.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The reason recorded by the first close call
    pub fn close_reason(&self) -> Option<DisconnectReason> {
        *self.close_reason.lock().unwrap()
    }

    /// Wait until the session is closed
    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        loop {
            let notified = self.close_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
            if self.is_closed() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("variant", &self.variant)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session(capacity: usize) -> (std::sync::Arc<Session>, mpsc::Receiver<Bytes>) {
        Session::new(
            ConnectionId(1),
            "10.0.0.1:40000".parse().unwrap(),
            ProtocolVariant::V1,
            vec![0xaa, 0xbb, 0xcc, 0xdd],
            capacity,
        )
    }

    #[tokio::test]
    async fn test_send_and_drain() {
        let (session, mut rx) = test_session(4);
        session.send(Bytes::from_static(b"hello")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_full_egress_reports_slow_consumer() {
        let (session, _rx) = test_session(1);
        session.send(Bytes::from_static(b"one")).unwrap();
        assert!(matches!(
            session.send(Bytes::from_static(b"two")),
            Err(ServerError::EgressFull)
        ));
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let (session, _rx) = test_session(1);
        session.close(DisconnectReason::SlowConsumer);
        session.close(DisconnectReason::IdleTimeout);
        // The first reason wins
        assert_eq!(
            session.close_reason(),
            Some(DisconnectReason::SlowConsumer)
        );
        assert!(matches!(
            session.send(Bytes::from_static(b"x")),
            Err(ServerError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_wait_closed_wakes() {
        let (session, _rx) = test_session(1);
        let waiter = session.clone();
        let handle = tokio::spawn(async move { waiter.wait_closed().await });
        session.close(DisconnectReason::Shutdown);
        handle.await.unwrap();
    }

    #[test]
    fn test_authorize_sets_worker() {
        let (session, _rx) = test_session(1);
        assert!(!session.is_authorized());
        session.authorize("worker.a");
        assert!(session.is_authorized());
        assert_eq!(session.worker().as_deref(), Some("worker.a"));
    }

    #[test]
    fn test_activity_is_monotonic() {
        let (session, _rx) = test_session(1);
        let before = session.last_activity.load(Ordering::Relaxed);
        session.touch();
        assert!(session.last_activity.load(Ordering::Relaxed) >= before);
    }
}
