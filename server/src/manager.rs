//! Sharded connection registry
//!
//! Sessions are spread over a power-of-two number of shards indexed by a
//! hash of the connection id. Every mutating operation takes a single shard
//! lock; the headline active count is atomic. The registry also keeps the
//! per-address admission counters, a temporary address deny list, and the
//! idle reaper.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use orepool_core::ConnectionId;

use crate::session::Session;
use crate::DisconnectReason;

/// Admission failures, surfaced before any Stratum reply is sent
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("per-address connection limit reached")]
    IpLimitReached,

    #[error("global connection limit reached")]
    MaxConnectionsReached,

    #[error("address is temporarily banned")]
    AddressBanned,
}

/// Registry tuning
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Number of shards; must be a power of two
    pub shard_count: usize,
    /// Global cap on concurrent sessions
    pub max_total: usize,
    /// Cap on concurrent sessions per remote address
    pub max_per_address: usize,
    /// Idle threshold enforced by the reaper
    pub idle_timeout: Duration,
    /// How often the reaper scans
    pub reap_interval: Duration,
    /// How long a sticky deny lasts
    pub ban_duration: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            shard_count: 16,
            max_total: 50_000,
            max_per_address: 32,
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            ban_duration: Duration::from_secs(900),
        }
    }
}

/// One sub-registry; the lock guards both maps
#[derive(Default)]
struct Shard {
    sessions: HashMap<ConnectionId, Arc<Session>>,
    per_address: HashMap<IpAddr, usize>,
}

type ConnectCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn(&Arc<Session>, DisconnectReason) + Send + Sync>;

pub struct ConnectionManager {
    shards: Vec<RwLock<Shard>>,
    shard_mask: u64,
    active: AtomicUsize,
    config: ManagerConfig,

    /// Sticky deny list: address to ban expiry
    banned: Mutex<HashMap<IpAddr, Instant>>,

    on_connect: Mutex<Option<ConnectCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl ConnectionManager {
    /// Create a registry. Panics if the shard count is not a power of two;
    /// configuration validation rejects that before construction.
    pub fn new(config: ManagerConfig) -> Arc<ConnectionManager> {
        assert!(
            config.shard_count.is_power_of_two() && config.shard_count > 0,
            "shard count must be a power of two"
        );
        let shards = (0..config.shard_count)
            .map(|_| RwLock::new(Shard::default()))
            .collect();
        Arc::new(ConnectionManager {
            shards,
            shard_mask: (config.shard_count - 1) as u64,
            active: AtomicUsize::new(0),
            config,
            banned: Mutex::new(HashMap::new()),
            on_connect: Mutex::new(None),
            on_disconnect: Mutex::new(None),
        })
    }

    /// Install lifecycle callbacks; replaces any previous ones
    pub fn set_callbacks(
        &self,
        on_connect: Option<ConnectCallback>,
        on_disconnect: Option<DisconnectCallback>,
    ) {
        *self.on_connect.lock().unwrap() = on_connect;
        *self.on_disconnect.lock().unwrap() = on_disconnect;
    }

    fn shard_for(&self, id: ConnectionId) -> &RwLock<Shard> {
        // Spread sequential ids across shards
        let hash = id.0.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Number of live sessions
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Install a session, enforcing the admission caps.
    ///
    /// The per-address and global checks are evaluated at admission time;
    /// admission exactly at a cap succeeds and the next one fails.
    pub fn add(&self, session: Arc<Session>) -> Result<(), AdmissionError> {
        let ip = session.remote_addr().ip();
        if self.is_banned(&ip) {
            return Err(AdmissionError::AddressBanned);
        }

        // Reserve a slot in the global counter first so a racing add cannot
        // overshoot the cap, then roll back if the shard rejects
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current >= self.config.max_total {
                    None
                } else {
                    Some(current + 1)
                }
            });
        if reserved.is_err() {
            return Err(AdmissionError::MaxConnectionsReached);
        }

        let shard = self.shard_for(session.id());
        {
            let mut guard = shard.write().unwrap();
            let count = guard.per_address.entry(ip).or_insert(0);
            if *count >= self.config.max_per_address {
                drop(guard);
                self.active.fetch_sub(1, Ordering::SeqCst);
                return Err(AdmissionError::IpLimitReached);
            }
            *count += 1;
            guard.sessions.insert(session.id(), session.clone());
        }

        debug!(
            "{} registered from {} ({} active)",
            session.id(),
            session.remote_addr(),
            self.active_count()
        );
        if let Some(callback) = self.on_connect.lock().unwrap().as_ref() {
            callback(&session);
        }
        Ok(())
    }

    /// Remove a session; idempotent. Fires the disconnect callback only for
    /// the call that actually removed it.
    pub fn remove(&self, id: ConnectionId, reason: DisconnectReason) {
        let removed = {
            let shard = self.shard_for(id);
            let mut guard = shard.write().unwrap();
            match guard.sessions.remove(&id) {
                Some(session) => {
                    let ip = session.remote_addr().ip();
                    if let Some(count) = guard.per_address.get_mut(&ip) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            guard.per_address.remove(&ip);
                        }
                    }
                    Some(session)
                }
                None => None,
            }
        };

        if let Some(session) = removed {
            self.active.fetch_sub(1, Ordering::SeqCst);
            debug!(
                "{} removed ({}, {} active)",
                id,
                reason,
                self.active_count()
            );
            if let Some(callback) = self.on_disconnect.lock().unwrap().as_ref() {
                callback(&session, reason);
            }
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.shard_for(id).read().unwrap().sessions.get(&id).cloned()
    }

    /// All sessions from one remote address
    pub fn get_by_address(&self, ip: IpAddr) -> Vec<Arc<Session>> {
        let mut found = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            found.extend(
                guard
                    .sessions
                    .values()
                    .filter(|s| s.remote_addr().ip() == ip)
                    .cloned(),
            );
        }
        found
    }

    /// Visit every session; the visitor returns false to stop early.
    ///
    /// The visitor runs under a shard read lock and must not call back into
    /// the registry.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<Session>) -> bool) {
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for session in guard.sessions.values() {
                if !visitor(session) {
                    return;
                }
            }
        }
    }

    /// Refresh a session's activity stamp
    pub fn update_activity(&self, id: ConnectionId) {
        if let Some(session) = self.get(id) {
            session.touch();
        }
    }

    /// Fan the same payload out to every session.
    ///
    /// Never blocks on a slow consumer: sessions whose egress queue is full
    /// are closed with the slow-consumer reason after the locks are
    /// released. Returns the number of sessions the payload reached.
    pub fn broadcast(&self, payload: Bytes) -> usize {
        self.broadcast_filtered(payload, |_| true)
    }

    /// Fan out to authorized sessions only
    pub fn broadcast_authorized(&self, payload: Bytes) -> usize {
        self.broadcast_filtered(payload, |s| s.is_authorized())
    }

    fn broadcast_filtered(
        &self,
        payload: Bytes,
        filter: impl Fn(&Arc<Session>) -> bool,
    ) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for session in guard.sessions.values() {
                if !filter(session) {
                    continue;
                }
                match session.send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(crate::ServerError::EgressFull) => slow.push(session.clone()),
                    Err(_) => {}
                }
            }
        }
        for session in slow {
            warn!("{} egress overflow during broadcast", session.id());
            session.close(DisconnectReason::SlowConsumer);
        }
        delivered
    }

    /// Build per-session payloads under the shard read locks.
    ///
    /// Used for pushes that differ per session (per-target job notifies).
    /// The builder must not call back into the registry.
    pub fn broadcast_with(&self, build: impl Fn(&Arc<Session>) -> Option<Bytes>) -> usize {
        let mut delivered = 0;
        let mut slow = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().unwrap();
            for session in guard.sessions.values() {
                if let Some(payload) = build(session) {
                    match session.send(payload) {
                        Ok(()) => delivered += 1,
                        Err(crate::ServerError::EgressFull) => slow.push(session.clone()),
                        Err(_) => {}
                    }
                }
            }
        }
        for session in slow {
            warn!("{} egress overflow during broadcast", session.id());
            session.close(DisconnectReason::SlowConsumer);
        }
        delivered
    }

    /// Add a sticky deny for an address
    pub fn ban(&self, ip: IpAddr) {
        info!("{} banned for {:?}", ip, self.config.ban_duration);
        self.banned
            .lock()
            .unwrap()
            .insert(ip, Instant::now() + self.config.ban_duration);
    }

    /// Check the deny list, purging the entry once expired
    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        let mut banned = self.banned.lock().unwrap();
        match banned.get(ip) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                banned.remove(ip);
                false
            }
            None => false,
        }
    }

    /// Close sessions idle past the threshold
    pub fn reap_idle(&self) -> usize {
        let mut idle = Vec::new();
        self.for_each(|session| {
            if session.idle_for() > self.config.idle_timeout {
                idle.push(session.clone());
            }
            true
        });
        let count = idle.len();
        for session in idle {
            info!(
                "{} idle for {:?}, closing",
                session.id(),
                session.idle_for()
            );
            session.close(DisconnectReason::IdleTimeout);
        }
        count
    }

    /// Periodic idle reaping until shutdown flips
    pub fn spawn_idle_reaper(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.reap_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.reap_idle();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Close every session, used during graceful shutdown
    pub fn close_all(&self, reason: DisconnectReason) {
        self.for_each(|session| {
            session.close(reason);
            true
        });
    }

    /// Sum of sessions across shards; equals `active_count` when quiescent
    pub fn shard_census(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().unwrap().sessions.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orepool_core::ProtocolVariant;
    use tokio::sync::mpsc;

    fn config(max_total: usize, max_per_address: usize) -> ManagerConfig {
        ManagerConfig {
            shard_count: 4,
            max_total,
            max_per_address,
            idle_timeout: Duration::from_secs(600),
            reap_interval: Duration::from_secs(60),
            ban_duration: Duration::from_secs(60),
        }
    }

    fn session(id: u64, addr: &str) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        Session::new(
            ConnectionId(id),
            addr.parse().unwrap(),
            ProtocolVariant::V1,
            vec![0; 4],
            8,
        )
    }

    #[test]
    fn test_per_ip_cap_boundary() {
        let manager = ConnectionManager::new(config(100, 3));
        let mut keep = Vec::new();
        for i in 0..3 {
            let (s, rx) = session(i, "10.0.0.1:1000");
            manager.add(s).unwrap();
            keep.push(rx);
        }
        // Admission at the cap succeeded; the next one fails
        let (s4, _rx4) = session(3, "10.0.0.1:1003");
        assert_eq!(manager.add(s4), Err(AdmissionError::IpLimitReached));

        // A different address is unaffected
        let (other, _rx) = session(4, "10.0.0.2:1000");
        manager.add(other).unwrap();
    }

    #[test]
    fn test_global_cap_boundary() {
        let manager = ConnectionManager::new(config(2, 10));
        let (a, _ra) = session(1, "10.0.0.1:1000");
        let (b, _rb) = session(2, "10.0.0.2:1000");
        manager.add(a).unwrap();
        manager.add(b).unwrap();

        let (c, _rc) = session(3, "10.0.0.3:1000");
        assert_eq!(manager.add(c), Err(AdmissionError::MaxConnectionsReached));

        // Removing one frees a slot
        manager.remove(ConnectionId(1), DisconnectReason::PeerGone);
        let (d, _rd) = session(4, "10.0.0.3:1000");
        manager.add(d).unwrap();
    }

    #[test]
    fn test_census_matches_active_counter() {
        let manager = ConnectionManager::new(config(100, 10));
        let mut receivers = Vec::new();
        for i in 0..17 {
            let (s, rx) = session(i, &format!("10.0.0.{}:1000", i % 5 + 1));
            manager.add(s).unwrap();
            receivers.push(rx);
        }
        assert_eq!(manager.active_count(), 17);
        assert_eq!(manager.shard_census(), 17);

        for i in 0..5 {
            manager.remove(ConnectionId(i), DisconnectReason::PeerGone);
        }
        assert_eq!(manager.active_count(), 12);
        assert_eq!(manager.shard_census(), 12);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let manager = ConnectionManager::new(config(10, 10));
        let (s, _rx) = session(1, "10.0.0.1:1000");
        manager.add(s).unwrap();
        manager.remove(ConnectionId(1), DisconnectReason::PeerGone);
        manager.remove(ConnectionId(1), DisconnectReason::PeerGone);
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn test_disconnect_callback_fires_once() {
        let manager = ConnectionManager::new(config(10, 10));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        manager.set_callbacks(
            None,
            Some(Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let (s, _rx) = session(1, "10.0.0.1:1000");
        manager.add(s).unwrap();
        manager.remove(ConnectionId(1), DisconnectReason::PeerGone);
        manager.remove(ConnectionId(1), DisconnectReason::PeerGone);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_broadcast_skips_unauthorized() {
        let manager = ConnectionManager::new(config(10, 10));
        let (a, mut rx_a) = session(1, "10.0.0.1:1000");
        let (b, mut rx_b) = session(2, "10.0.0.2:1000");
        a.authorize("worker.a");
        manager.add(a).unwrap();
        manager.add(b).unwrap();

        let delivered = manager.broadcast_authorized(Bytes::from_static(b"job"));
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"job"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_marks_slow_consumer() {
        let manager = ConnectionManager::new(config(10, 10));
        let (slow, _rx) = Session::new(
            ConnectionId(1),
            "10.0.0.1:1000".parse().unwrap(),
            ProtocolVariant::V1,
            vec![0; 4],
            1,
        );
        manager.add(slow.clone()).unwrap();

        // First fill the queue, then the broadcast overflows it
        manager.broadcast(Bytes::from_static(b"one"));
        manager.broadcast(Bytes::from_static(b"two"));
        assert!(slow.is_closed());
        assert_eq!(
            slow.close_reason(),
            Some(DisconnectReason::SlowConsumer)
        );
    }

    #[test]
    fn test_ban_expires() {
        let mut cfg = config(10, 10);
        cfg.ban_duration = Duration::from_millis(0);
        let manager = ConnectionManager::new(cfg);
        let ip: IpAddr = "10.0.0.9".parse().unwrap();
        manager.ban(ip);
        // Zero-length ban expires immediately
        assert!(!manager.is_banned(&ip));
    }

    #[test]
    fn test_banned_address_rejected() {
        let manager = ConnectionManager::new(config(10, 10));
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        manager.ban(ip);
        let (s, _rx) = session(1, "10.0.0.7:1000");
        assert_eq!(manager.add(s), Err(AdmissionError::AddressBanned));
    }

    #[test]
    fn test_get_by_address() {
        let manager = ConnectionManager::new(config(10, 10));
        let (a, _ra) = session(1, "10.0.0.1:1000");
        let (b, _rb) = session(2, "10.0.0.1:2000");
        let (c, _rc) = session(3, "10.0.0.2:1000");
        manager.add(a).unwrap();
        manager.add(b).unwrap();
        manager.add(c).unwrap();
        assert_eq!(manager.get_by_address("10.0.0.1".parse().unwrap()).len(), 2);
    }

    #[test]
    fn test_for_each_early_stop() {
        let manager = ConnectionManager::new(config(10, 10));
        let mut receivers = Vec::new();
        for i in 0..5 {
            let (s, rx) = session(i, "10.0.0.1:1000");
            manager.add(s).unwrap();
            receivers.push(rx);
        }
        let mut visited = 0;
        manager.for_each(|_| {
            visited += 1;
            visited < 2
        });
        assert_eq!(visited, 2);
    }
}
