//! Process-wide connectivity state.
//!
//! The OS integration (or [`spawn_probe_loop`]) reports what it observes via
//! [`NetworkMonitor::set_state`]; subscribers only hear about edges.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use parley_shared::ConnectivityState;

/// Emitted on a connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
    CameOnline,
    WentOffline,
}

#[derive(Clone)]
pub struct NetworkMonitor {
    state: Arc<watch::Sender<ConnectivityState>>,
    events: broadcast::Sender<ConnectivityEvent>,
}

impl NetworkMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(64);
        Self {
            state: Arc::new(state),
            events,
        }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Record an observation.  Returns `true` if it was a transition.
    pub fn set_state(&self, next: ConnectivityState) -> bool {
        // Events go out under the watch lock so their order matches the
        // order of the state changes.
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            let event = match next {
                ConnectivityState::Online => ConnectivityEvent::CameOnline,
                ConnectivityState::Offline => ConnectivityEvent::WentOffline,
            };
            // No subscribers is fine.
            let _ = self.events.send(event);
            true
        });

        if changed {
            info!(state = ?next, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }
}

/// Something that can tell whether the remote side is reachable right now.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync + 'static {
    async fn check(&self) -> bool;
}

/// Reachable if a TCP connection to `addr` opens within `timeout`.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: SocketAddr,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn check(&self) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        )
    }
}

/// Poll `probe` every `interval` and feed the result to `monitor` until
/// `shutdown` flips to `true`.  Flaps shorter than one interval are never
/// observed.
pub fn spawn_probe_loop<P>(
    monitor: NetworkMonitor,
    probe: P,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    P: ReachabilityProbe,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let state = if probe.check().await {
                        ConnectivityState::Online
                    } else {
                        ConnectivityState::Offline
                    };
                    monitor.set_state(state);
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Reachability probe stopped");
    })
}
