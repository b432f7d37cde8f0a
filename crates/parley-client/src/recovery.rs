//! Startup reconciliation.
//!
//! An entry left in `sending` by a previous process may or may not have
//! reached the remote store.  Before any drain runs, each such entry (and
//! every queued entry old enough to be suspicious) is checked with `exists`:
//! found means delivered, absent means queued again.  Nothing is resent from
//! here.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use parley_store::{DeliveryStatus, QueueEntry};

use crate::blobs::LocalBlobStore;
use crate::config::OutboxConfig;
use crate::error::Result;
use crate::events::{DeliveryEvent, DeliveryFeed};
use crate::queue::Collaborators;
use crate::remote::{RemoteError, RemoteSyncClient};
use crate::scheduler::RetryScheduler;
use crate::store::LocalStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub examined: usize,
    /// Found remotely and marked delivered.
    pub delivered: usize,
    /// Confirmed absent and queued again.
    pub requeued: usize,
    /// Outcome unknown; queued again and reported on the feed.
    pub deferred: usize,
    /// Confirmed absent after the user cancelled them; removed.
    pub cancelled: usize,
    /// The pass ran out of time before examining every entry.
    pub timed_out: bool,
}

pub struct CrashRecoveryService {
    store: LocalStore,
    remote: Arc<dyn RemoteSyncClient>,
    blobs: Arc<dyn LocalBlobStore>,
    scheduler: RetryScheduler,
    feed: DeliveryFeed,
    stale_after: Duration,
    timeout: Duration,
    attempts: u32,
}

impl CrashRecoveryService {
    pub fn new(config: &OutboxConfig, deps: &Collaborators, feed: DeliveryFeed) -> Self {
        Self {
            store: deps.store.clone(),
            remote: deps.remote.clone(),
            blobs: deps.blobs.clone(),
            scheduler: RetryScheduler::from_config(config),
            feed,
            stale_after: config.stale_after,
            timeout: config.recovery_timeout,
            attempts: config.recovery_attempts,
        }
    }

    /// Resolve every ambiguous entry.  Only local persistence failures are
    /// returned as errors; remote trouble ends in deferral.
    pub async fn run(&self) -> Result<RecoveryReport> {
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(now);

        let candidates = self
            .store
            .with(|db| db.list_recovery_candidates(stale_before))?;

        let mut report = RecoveryReport {
            examined: candidates.len(),
            ..RecoveryReport::default()
        };
        if candidates.is_empty() {
            debug!("Nothing to recover");
            return Ok(report);
        }
        info!(count = candidates.len(), "Reconciling unresolved messages");

        let deadline = tokio::time::Instant::now() + self.timeout;

        for (index, entry) in candidates.iter().enumerate() {
            match tokio::time::timeout_at(deadline, self.check(entry)).await {
                Ok(Ok(true)) => {
                    self.mark_delivered(entry).await?;
                    report.delivered += 1;
                }
                Ok(Ok(false)) if entry.cancelled => {
                    self.drop_cancelled(entry).await?;
                    report.cancelled += 1;
                }
                Ok(Ok(false)) => {
                    self.requeue(entry)?;
                    report.requeued += 1;
                }
                Ok(Err(e)) => {
                    self.defer(entry, &e.to_string())?;
                    report.deferred += 1;
                }
                Err(_) => {
                    warn!(
                        remaining = candidates.len() - index,
                        "Recovery timed out, deferring the rest"
                    );
                    report.timed_out = true;
                    for rest in &candidates[index..] {
                        self.defer(rest, "recovery timed out")?;
                        report.deferred += 1;
                    }
                    break;
                }
            }
        }

        info!(
            delivered = report.delivered,
            requeued = report.requeued,
            deferred = report.deferred,
            cancelled = report.cancelled,
            "Recovery finished"
        );
        Ok(report)
    }

    /// `exists`, retried with backoff on transient errors.
    async fn check(&self, entry: &QueueEntry) -> std::result::Result<bool, RemoteError> {
        let mut attempt = 1;
        loop {
            match self.remote.exists(entry.id).await {
                Ok(found) => {
                    debug!(msg_id = %entry.id, found, "Existence check");
                    return Ok(found);
                }
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    debug!(msg_id = %entry.id, attempt, error = %e, "Existence check failed");
                    tokio::time::sleep(self.scheduler.backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn mark_delivered(&self, entry: &QueueEntry) -> Result<()> {
        let retired = self
            .store
            .with(|db| db.complete_delivery(entry.id, entry.uploaded_ref.as_deref()))?;
        info!(msg_id = %entry.id, "Found remotely, marked delivered");

        if let Some(local_ref) = retired.and_then(|e| e.payload.local_blob()) {
            if let Err(e) = self.blobs.delete(local_ref).await {
                warn!(msg_id = %entry.id, error = %e, "Failed to release blob");
            }
        }
        self.feed
            .status(entry.id, &entry.conversation_id, DeliveryStatus::Delivered);
        Ok(())
    }

    async fn drop_cancelled(&self, entry: &QueueEntry) -> Result<()> {
        self.store.with(|db| db.retire_entry(entry.id, true))?;
        if let Some(local_ref) = entry.payload.local_blob() {
            if let Err(e) = self.blobs.delete(local_ref).await {
                warn!(msg_id = %entry.id, error = %e, "Failed to release blob");
            }
        }
        self.feed.publish(DeliveryEvent::Removed {
            message_id: entry.id,
            conversation_id: entry.conversation_id.clone(),
        });
        Ok(())
    }

    /// Back to `queued`.  An interrupted send is eligible at once; a stale
    /// entry keeps its schedule.
    fn requeue(&self, entry: &QueueEntry) -> Result<()> {
        let eligible = if entry.status == DeliveryStatus::Sending {
            Utc::now()
        } else {
            entry.next_eligible_at
        };
        self.store.with(|db| db.requeue(entry.id, eligible))?;
        self.feed
            .status(entry.id, &entry.conversation_id, DeliveryStatus::Queued);
        Ok(())
    }

    fn defer(&self, entry: &QueueEntry, reason: &str) -> Result<()> {
        warn!(msg_id = %entry.id, reason, "Delivery state unknown, queued again");
        self.requeue(entry)?;
        self.feed.publish(DeliveryEvent::RecoveryDeferred {
            message_id: entry.id,
            conversation_id: entry.conversation_id.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, SubsecRound};
    use parley_shared::{ConnectivityState, ConversationId, UserId};
    use parley_store::Payload;
    use tempfile::TempDir;

    use super::*;
    use crate::auth::StaticAuth;
    use crate::blobs::FsBlobStore;
    use crate::network::NetworkMonitor;
    use crate::remote::{MemoryRemote, RemoteBody, RemoteMessage};

    struct Harness {
        recovery: CrashRecoveryService,
        store: LocalStore,
        remote: Arc<MemoryRemote>,
        feed: DeliveryFeed,
        _dir: TempDir,
    }

    async fn harness(config: OutboxConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open_at(&dir.path().join("parley.db")).unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let feed = DeliveryFeed::new(64);
        let deps = Collaborators {
            store: store.clone(),
            remote: remote.clone(),
            blobs: Arc::new(FsBlobStore::new(dir.path().join("blobs"), 1024).await.unwrap()),
            auth: Arc::new(StaticAuth::new("alice")),
            network: NetworkMonitor::new(ConnectivityState::Online),
        };
        Harness {
            recovery: CrashRecoveryService::new(&config, &deps, feed.clone()),
            store,
            remote,
            feed,
            _dir: dir,
        }
    }

    fn config() -> OutboxConfig {
        OutboxConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            backoff_jitter: Duration::ZERO,
            recovery_attempts: 3,
            ..OutboxConfig::default()
        }
    }

    /// An entry a crashed process left in `sending`.
    fn interrupted(h: &Harness) -> QueueEntry {
        let entry = QueueEntry::new(ConversationId::new("c"), UserId::new("alice"), Payload::text("hi"));
        h.store
            .with(|db| {
                db.enqueue_entry(&entry)?;
                db.claim_entry(entry.id, Utc::now())
            })
            .unwrap();
        entry
    }

    fn remote_copy(entry: &QueueEntry) -> RemoteMessage {
        RemoteMessage {
            id: entry.id,
            conversation_id: entry.conversation_id.clone(),
            sender_id: entry.sender_id.clone(),
            created_at: entry.created_at,
            body: RemoteBody::Text {
                content: "hi".into(),
            },
        }
    }

    #[tokio::test]
    async fn present_remotely_means_delivered() {
        let h = harness(config()).await;
        let entry = interrupted(&h);
        h.remote.insert(remote_copy(&entry));

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(h.remote.total_create_calls(), 0);

        let message = h.store.with(|db| db.get_message(entry.id)).unwrap();
        assert_eq!(message.delivery_status, DeliveryStatus::Delivered);
        assert!(h.store.with(|db| db.find_queue_entry(entry.id)).unwrap().is_none());
    }

    #[tokio::test]
    async fn absent_remotely_means_queued() {
        let h = harness(config()).await;
        let entry = interrupted(&h);

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.requeued, 1);

        let after = h.store.with(|db| db.get_queue_entry(entry.id)).unwrap();
        assert_eq!(after.status, DeliveryStatus::Queued);
        assert_eq!(after.attempt_count, 0);
        assert!(after.next_eligible_at <= Utc::now());
    }

    #[tokio::test]
    async fn stale_entry_keeps_its_schedule() {
        let h = harness(config()).await;
        let old: DateTime<Utc> = (Utc::now() - chrono::Duration::days(3)).trunc_subsecs(3);
        let later = (Utc::now() + chrono::Duration::minutes(5)).trunc_subsecs(3);
        let mut entry = QueueEntry::new(ConversationId::new("c"), UserId::new("alice"), Payload::text("hi"));
        entry.created_at = old;
        entry.next_eligible_at = later;
        h.store.with(|db| db.enqueue_entry(&entry)).unwrap();

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.requeued, 1);

        let after = h.store.with(|db| db.get_queue_entry(entry.id)).unwrap();
        assert_eq!(after.next_eligible_at, later);
    }

    #[tokio::test]
    async fn fresh_queued_entry_is_not_examined() {
        let h = harness(config()).await;
        let entry = QueueEntry::new(ConversationId::new("c"), UserId::new("alice"), Payload::text("hi"));
        h.store.with(|db| db.enqueue_entry(&entry)).unwrap();

        assert_eq!(h.recovery.run().await.unwrap(), RecoveryReport::default());
        assert_eq!(h.remote.exists_calls(), 0);
    }

    #[tokio::test]
    async fn transient_check_failures_are_retried() {
        let h = harness(config()).await;
        let entry = interrupted(&h);
        h.remote.insert(remote_copy(&entry));
        h.remote.fail_next_exists(2);

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(h.remote.exists_calls(), 3);
    }

    #[tokio::test]
    async fn unreachable_remote_defers() {
        let h = harness(config()).await;
        let entry = interrupted(&h);
        let mut events = h.feed.subscribe();
        h.remote.set_offline(true);

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(h.remote.exists_calls(), 3);

        let after = h.store.with(|db| db.get_queue_entry(entry.id)).unwrap();
        assert_eq!(after.status, DeliveryStatus::Queued);

        let deferred = std::iter::from_fn(|| events.try_recv().ok())
            .any(|e| matches!(e, DeliveryEvent::RecoveryDeferred { message_id, .. } if message_id == entry.id));
        assert!(deferred);
    }

    #[tokio::test]
    async fn timeout_defers_remaining_entries() {
        let h = harness(OutboxConfig {
            recovery_timeout: Duration::from_millis(50),
            ..config()
        })
        .await;
        let first = interrupted(&h);
        let second = interrupted(&h);
        h.remote.set_latency(Some(Duration::from_millis(500)));

        let report = h.recovery.run().await.unwrap();
        assert!(report.timed_out);
        assert_eq!(report.deferred, 2);

        for id in [first.id, second.id] {
            let after = h.store.with(|db| db.get_queue_entry(id)).unwrap();
            assert_eq!(after.status, DeliveryStatus::Queued);
        }
    }

    #[tokio::test]
    async fn cancelled_and_absent_is_removed() {
        let h = harness(config()).await;
        let entry = interrupted(&h);
        h.store.with(|db| db.mark_cancelled(entry.id)).unwrap();

        let report = h.recovery.run().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert!(!h.store.with(|db| db.message_exists(entry.id)).unwrap());
    }

    #[tokio::test]
    async fn delivered_image_keeps_uploaded_ref() {
        let h = harness(config()).await;
        let entry = QueueEntry::new(
            ConversationId::new("c"),
            UserId::new("alice"),
            Payload::image(uuid::Uuid::new_v4(), 2, 2),
        );
        h.store
            .with(|db| {
                db.enqueue_entry(&entry)?;
                db.claim_entry(entry.id, Utc::now())?;
                db.record_upload(entry.id, "mem://blobs/1")
            })
            .unwrap();
        h.remote.insert(RemoteMessage {
            body: RemoteBody::Image {
                url: "mem://blobs/1".into(),
                width: 2,
                height: 2,
            },
            ..remote_copy(&entry)
        });

        h.recovery.run().await.unwrap();
        let message = h.store.with(|db| db.get_message(entry.id)).unwrap();
        assert_eq!(message.remote_ref.as_deref(), Some("mem://blobs/1"));
    }
}
