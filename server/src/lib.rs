//! Orepool Connection Layer
//!
//! Listeners, per-connection sessions, and the sharded connection registry.
//! A connection is served by exactly two tasks: an inbound decoder that
//! turns wire bytes into protocol frames for the session handler, and an
//! outbound pusher that drains the session's bounded egress queue. The
//! registry enforces per-address and global admission caps and reaps idle
//! sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use orepool_protocol::v1::StratumRequest;
use orepool_protocol::Message;

pub mod listener;
pub mod manager;
pub mod session;

pub use listener::{ListenerConfig, PoolListener};
pub use manager::{AdmissionError, ConnectionManager, ManagerConfig};
pub use session::{Session, SessionState};

/// Server error types
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] orepool_protocol::ProtocolError),

    #[error("Admission rejected: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Session closed")]
    SessionClosed,

    #[error("Egress queue full")]
    EgressFull,

    #[error("Handler failure: {0}")]
    Handler(String),
}

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Peer closed the connection or the read side errored
    PeerGone,
    /// No activity within the idle threshold
    IdleTimeout,
    /// The egress queue overflowed
    SlowConsumer,
    /// Frame-layer or crypto-layer violation
    ProtocolError,
    /// Handler asked for the session to end
    HandlerClosed,
    /// Server is shutting down
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            DisconnectReason::PeerGone => "peer gone",
            DisconnectReason::IdleTimeout => "idle timeout",
            DisconnectReason::SlowConsumer => "slow consumer",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::HandlerClosed => "handler closed",
            DisconnectReason::Shutdown => "shutdown",
        };
        write!(f, "{}", reason)
    }
}

/// One decoded inbound unit, independent of the wire variant
#[derive(Debug, Clone)]
pub enum Incoming {
    V1(StratumRequest),
    V2(Message),
}

/// Implemented by the mining layer; called from connection tasks.
///
/// `on_frame` errors close the session. Handlers reply by pushing encoded
/// payloads onto the session's egress queue.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// A session passed admission and (for V2) finished its handshake
    async fn on_connect(&self, session: &Arc<Session>);

    /// One decoded frame from the peer
    async fn on_frame(&self, session: &Arc<Session>, frame: Incoming) -> Result<(), ServerError>;

    /// The session is gone; fired exactly once per connected session
    async fn on_disconnect(&self, session: &Arc<Session>, reason: DisconnectReason);
}

/// Byte and connection counters surfaced to the coordinator
#[derive(Debug, Default)]
pub struct ServerCounters {
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub connections_accepted: AtomicU64,
    pub connections_rejected: AtomicU64,
}

impl ServerCounters {
    pub fn new() -> Arc<ServerCounters> {
        Arc::new(ServerCounters::default())
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }
}
