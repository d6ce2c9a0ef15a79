//! External reachability watchdog
//!
//! Probes a set of TCP endpoints at a fixed cadence. Transitions require
//! consecutive observations: K successes to go online, M failures to go
//! offline. When connectivity returns after an outage the transient
//! Restored state is published once so observers can trigger recovery,
//! then collapses to Online.

use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Observable connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkState {
    Unknown,
    Online,
    Offline,
    /// Connectivity returned after an outage; collapses to Online
    Restored,
}

/// Watchdog tuning
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Probe cadence
    pub check_interval: Duration,
    /// TCP endpoints, host:port
    pub check_hosts: Vec<String>,
    /// Per-probe connect deadline
    pub check_timeout: Duration,
    /// Consecutive failures before Offline
    pub failures_for_offline: u32,
    /// Consecutive successes before Online
    pub successes_for_online: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            check_interval: Duration::from_secs(30),
            check_hosts: vec!["1.1.1.1:53".to_string(), "8.8.8.8:53".to_string()],
            check_timeout: Duration::from_secs(5),
            failures_for_offline: 3,
            successes_for_online: 2,
        }
    }
}

/// The hysteresis state machine, separated from I/O for testability
#[derive(Debug)]
pub struct ReachabilityTracker {
    state: NetworkState,
    successes: u32,
    failures: u32,
    successes_for_online: u32,
    failures_for_offline: u32,
    /// Set once the machine has been Offline; the next Online is Restored
    was_offline: bool,
}

impl ReachabilityTracker {
    pub fn new(successes_for_online: u32, failures_for_offline: u32) -> ReachabilityTracker {
        ReachabilityTracker {
            state: NetworkState::Unknown,
            successes: 0,
            failures: 0,
            successes_for_online: successes_for_online.max(1),
            failures_for_offline: failures_for_offline.max(1),
            was_offline: false,
        }
    }

    pub fn state(&self) -> NetworkState {
        self.state
    }

    /// Feed one probe result; returns the transition to publish, if any.
    ///
    /// A recovery from Offline yields Restored exactly once; the machine
    /// itself settles on Online.
    pub fn observe(&mut self, success: bool) -> Option<NetworkState> {
        if success {
            self.successes += 1;
            self.failures = 0;
        } else {
            self.failures += 1;
            self.successes = 0;
        }

        match self.state {
            NetworkState::Online => {
                if self.failures >= self.failures_for_offline {
                    self.state = NetworkState::Offline;
                    self.was_offline = true;
                    return Some(NetworkState::Offline);
                }
            }
            NetworkState::Unknown | NetworkState::Offline => {
                if self.successes >= self.successes_for_online {
                    let restored = self.was_offline;
                    self.state = NetworkState::Online;
                    return Some(if restored {
                        NetworkState::Restored
                    } else {
                        NetworkState::Online
                    });
                }
                if self.state == NetworkState::Unknown
                    && self.failures >= self.failures_for_offline
                {
                    self.state = NetworkState::Offline;
                    self.was_offline = true;
                    return Some(NetworkState::Offline);
                }
            }
            // The machine never rests in Restored
            NetworkState::Restored => unreachable!(),
        }
        None
    }
}

/// Probes endpoints and publishes state transitions
pub struct NetworkWatchdog {
    config: WatchdogConfig,
    publisher: watch::Sender<NetworkState>,
}

impl NetworkWatchdog {
    pub fn new(config: WatchdogConfig) -> NetworkWatchdog {
        let (publisher, _) = watch::channel(NetworkState::Unknown);
        NetworkWatchdog { config, publisher }
    }

    pub fn subscribe(&self) -> watch::Receiver<NetworkState> {
        self.publisher.subscribe()
    }

    /// One probe round: success when any endpoint accepts
    async fn probe(&self) -> bool {
        for host in &self.config.check_hosts {
            match timeout(self.config.check_timeout, TcpStream::connect(host)).await {
                Ok(Ok(_)) => {
                    debug!("probe {} reachable", host);
                    return true;
                }
                Ok(Err(e)) => debug!("probe {} failed: {}", host, e),
                Err(_) => debug!("probe {} timed out", host),
            }
        }
        false
    }

    /// Run until shutdown flips true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tracker = ReachabilityTracker::new(
                self.config.successes_for_online,
                self.config.failures_for_offline,
            );
            let mut ticker = tokio::time::interval(self.config.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                let up = self.probe().await;
                if let Some(transition) = tracker.observe(up) {
                    match transition {
                        NetworkState::Offline => warn!("external network unreachable"),
                        NetworkState::Restored => info!("external network restored"),
                        NetworkState::Online => info!("external network online"),
                        NetworkState::Unknown => {}
                    }
                    // Publish the transient Restored, then settle Online
                    self.publisher.send_replace(transition);
                    if transition == NetworkState::Restored {
                        self.publisher.send_replace(NetworkState::Online);
                    }
                }
            }
        })
    }
}
