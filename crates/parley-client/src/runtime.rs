//! Startup sequence and the background drain loop.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::OutboxConfig;
use crate::error::Result;
use crate::events::DeliveryFeed;
use crate::network::{ConnectivityEvent, NetworkMonitor};
use crate::queue::{Collaborators, MessageQueueService};
use crate::recovery::{CrashRecoveryService, RecoveryReport};

/// A running delivery core.
pub struct Outbox {
    queue: MessageQueueService,
    recovery: RecoveryReport,
    shutdown: watch::Sender<bool>,
    drain_task: JoinHandle<()>,
}

impl Outbox {
    /// Validate `config`, reconcile what a previous process left behind,
    /// then start draining.  No send is attempted before recovery returns.
    pub async fn start(config: OutboxConfig, deps: Collaborators) -> Result<Self> {
        config.validate()?;

        let feed = DeliveryFeed::default();
        let queue = MessageQueueService::new(config.clone(), deps.clone(), feed.clone());

        let recovery = CrashRecoveryService::new(&config, &deps, feed)
            .run()
            .await?;
        queue.open_barrier();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let drain_task = spawn_drain_loop(
            queue.clone(),
            deps.network.clone(),
            config.wake_interval,
            shutdown_rx,
        );

        info!(
            max_in_flight = config.max_in_flight,
            max_attempts = config.max_attempts,
            "Outbox started"
        );

        Ok(Self {
            queue,
            recovery,
            shutdown,
            drain_task,
        })
    }

    pub fn queue(&self) -> &MessageQueueService {
        &self.queue
    }

    pub fn feed(&self) -> &DeliveryFeed {
        self.queue.feed()
    }

    pub fn recovery_report(&self) -> RecoveryReport {
        self.recovery
    }

    pub fn request_flush(&self) {
        self.queue.request_flush();
    }

    /// Flips to `true` on shutdown.  Lets helpers such as the reachability
    /// probe stop together with the outbox.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Stop the drain loop after the pass in progress, if any.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.drain_task.await {
            error!(error = %e, "Drain loop panicked");
        }
        info!("Outbox stopped");
    }
}

/// Drain on every trigger: flush requests, connectivity coming back, and a
/// periodic wake that picks up entries whose backoff expired.
fn spawn_drain_loop(
    queue: MessageQueueService,
    network: NetworkMonitor,
    wake_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    // Subscribed before spawning so an edge right after start is not missed.
    let mut connectivity = network.subscribe();

    tokio::spawn(async move {
        let mut wake = tokio::time::interval(wake_interval);
        wake.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                _ = wake.tick() => {}
                _ = queue.flush_requested() => {
                    debug!("Flush requested");
                }
                event = connectivity.recv() => match event {
                    Ok(ConnectivityEvent::CameOnline) => info!("Back online, flushing"),
                    Ok(ConnectivityEvent::WentOffline) => continue,
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => continue,
                },
            }

            if let Err(e) = queue.drain().await {
                error!(error = %e, "Drain failed");
            }
        }
        debug!("Drain loop stopped");
    })
}
