//! The outbound message queue.
//!
//! Messages are written to the local store before anything touches the
//! network, then drained to the remote store by bounded concurrent workers.
//! Each drain claims an entry with a compare-and-set on its status, so two
//! overlapping drains never send the same entry at once.  Transient failures
//! are rescheduled with exponential backoff; permanent ones park the entry
//! until the user retries or discards it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use parley_shared::constants::MAX_TEXT_SIZE;
use parley_shared::ConversationId;
use parley_store::{DeliveryStatus, Payload, QueueEntry};

use crate::auth::AuthContext;
use crate::blobs::{BlobError, LocalBlobStore};
use crate::config::OutboxConfig;
use crate::error::{OutboxError, Result};
use crate::events::{DeliveryEvent, DeliveryFeed};
use crate::network::NetworkMonitor;
use crate::remote::{RemoteBody, RemoteError, RemoteMessage, RemoteSyncClient};
use crate::scheduler::RetryScheduler;
use crate::store::LocalStore;

/// Everything the delivery core talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: LocalStore,
    pub remote: Arc<dyn RemoteSyncClient>,
    pub blobs: Arc<dyn LocalBlobStore>,
    pub auth: Arc<dyn AuthContext>,
    pub network: NetworkMonitor,
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Entries this pass won the claim for.
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub permanently_failed: usize,
    /// Cancelled by the user while in flight and then failed.
    pub cancelled: usize,
    /// Listed as eligible but claimed elsewhere first.
    pub skipped: usize,
}

impl DrainReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered => self.delivered += 1,
            Outcome::Retried => self.retried += 1,
            Outcome::PermanentlyFailed => self.permanently_failed += 1,
            Outcome::Cancelled => self.cancelled += 1,
            Outcome::Unresolved => {}
        }
    }
}

/// Result of [`MessageQueueService::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The message was never sent and is gone.
    Removed,
    /// An attempt is in flight.  If it succeeds the message is delivered;
    /// if it fails the message is removed and not retried.
    AfterCurrentAttempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    Retried,
    PermanentlyFailed,
    Cancelled,
    /// The store could not record the result; the claim was handed back.
    Unresolved,
}

struct Inner {
    store: LocalStore,
    remote: Arc<dyn RemoteSyncClient>,
    blobs: Arc<dyn LocalBlobStore>,
    auth: Arc<dyn AuthContext>,
    network: NetworkMonitor,
    scheduler: RetryScheduler,
    feed: DeliveryFeed,
    config: OutboxConfig,
    permits: Arc<Semaphore>,
    ready: AtomicBool,
    flush: Notify,
}

#[derive(Clone)]
pub struct MessageQueueService {
    inner: Arc<Inner>,
}

impl MessageQueueService {
    pub fn new(config: OutboxConfig, deps: Collaborators, feed: DeliveryFeed) -> Self {
        let inner = Inner {
            store: deps.store,
            remote: deps.remote,
            blobs: deps.blobs,
            auth: deps.auth,
            network: deps.network,
            scheduler: RetryScheduler::from_config(&config),
            feed,
            permits: Arc::new(Semaphore::new(config.max_in_flight)),
            config,
            ready: AtomicBool::new(false),
            flush: Notify::new(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn feed(&self) -> &DeliveryFeed {
        &self.inner.feed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.inner.feed.subscribe()
    }

    // ------------------------------------------------------------------
    // Startup barrier and triggers
    // ------------------------------------------------------------------

    /// Allow drains.  Called once crash recovery has finished.
    pub fn open_barrier(&self) {
        if !self.inner.ready.swap(true, Ordering::SeqCst) {
            info!("Outbox ready");
            self.inner.flush.notify_one();
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Ask the drain loop for a pass.  Repeated requests coalesce.
    pub fn request_flush(&self) {
        self.inner.flush.notify_one();
    }

    pub(crate) async fn flush_requested(&self) {
        self.inner.flush.notified().await;
    }

    fn kick(&self) {
        if self.is_ready() && self.inner.network.is_online() {
            self.request_flush();
        }
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Persist `entry` as a new queued message and schedule a drain.
    ///
    /// The entry starts over as `queued` with no attempts, eligible now.
    /// When this returns `Ok` the message survives a crash.
    pub async fn enqueue(&self, mut entry: QueueEntry) -> Result<Uuid> {
        validate_payload(&entry.payload)?;

        let now = Utc::now();
        entry.status = DeliveryStatus::Queued;
        entry.attempt_count = 0;
        entry.next_eligible_at = entry.created_at.min(now);
        entry.uploaded_ref = None;
        entry.cancelled = false;
        entry.last_error = None;

        self.inner.store.with(|db| db.enqueue_entry(&entry))?;

        info!(
            msg_id = %entry.id,
            conversation = %entry.conversation_id,
            kind = entry.payload.kind(),
            "Message queued"
        );
        self.inner
            .feed
            .status(entry.id, &entry.conversation_id, DeliveryStatus::Queued);
        self.kick();
        Ok(entry.id)
    }

    pub async fn send_text(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<Uuid> {
        let sender = self
            .inner
            .auth
            .current_user()
            .ok_or(OutboxError::NotAuthenticated)?;
        let entry = QueueEntry::new(conversation_id, sender, Payload::text(content));
        self.enqueue(entry).await
    }

    /// Store the image bytes locally, then queue a message pointing at them.
    pub async fn send_image(
        &self,
        conversation_id: ConversationId,
        bytes: Bytes,
        width: u32,
        height: u32,
    ) -> Result<Uuid> {
        let sender = self
            .inner
            .auth
            .current_user()
            .ok_or(OutboxError::NotAuthenticated)?;
        if width == 0 || height == 0 {
            return Err(OutboxError::InvalidPayload(
                "image dimensions must be non-zero".into(),
            ));
        }

        let local_ref = self.inner.blobs.save(bytes).await?;
        let entry = QueueEntry::new(
            conversation_id,
            sender,
            Payload::image(local_ref, width, height),
        );

        match self.enqueue(entry).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Err(cleanup) = self.inner.blobs.delete(local_ref).await {
                    warn!(blob = %local_ref, error = %cleanup, "Failed to release blob");
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Drain
    // ------------------------------------------------------------------

    /// Attempt every entry that is eligible now.
    ///
    /// Safe to call concurrently and repeatedly.  Does nothing before the
    /// startup barrier opens or while offline.
    pub async fn drain(&self) -> Result<DrainReport> {
        let mut report = DrainReport::default();

        if !self.is_ready() {
            debug!("Drain skipped: recovery not finished");
            return Ok(report);
        }
        if !self.inner.network.is_online() {
            debug!("Drain skipped: offline");
            return Ok(report);
        }

        let batch = self.inner.config.drain_batch;
        let candidates = self
            .inner
            .store
            .with(|db| db.list_eligible(Utc::now(), batch))?;
        if candidates.is_empty() {
            return Ok(report);
        }
        debug!(count = candidates.len(), "Draining");

        let mut attempts = JoinSet::new();

        for candidate in candidates {
            if !self.inner.network.is_online() {
                debug!("Went offline mid-drain, not claiming further entries");
                break;
            }

            // Hold a permit before claiming so a claimed entry is always
            // being worked on.
            let permit = match self.inner.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            // Attempts already spawned must be joined, so a claim error is
            // never propagated from inside this loop.
            let id = candidate.id;
            let now = Utc::now();
            let claimed = self.inner.store.with(|db| {
                if !db.claim_entry(id, now)? {
                    return Ok(None);
                }
                // A claim that cannot be read back is handed straight back.
                match db.find_queue_entry(id) {
                    Ok(Some(entry)) => Ok(Some(entry)),
                    other => {
                        db.requeue(id, now)?;
                        other.map(|_| None)
                    }
                }
            });

            let entry = match claimed {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(msg_id = %id, error = %e, "Failed to claim entry, skipping");
                    report.skipped += 1;
                    continue;
                }
            };

            report.claimed += 1;
            self.inner
                .feed
                .status(entry.id, &entry.conversation_id, DeliveryStatus::Sending);

            let inner = self.inner.clone();
            attempts.spawn(async move { run_attempt(inner, entry, permit).await });
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!(error = %e, "Send attempt task failed"),
            }
        }

        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                permanently_failed = report.permanently_failed,
                "Drain finished"
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // User actions
    // ------------------------------------------------------------------

    /// Give a failed entry a fresh attempt budget and send it again.
    pub async fn retry(&self, id: Uuid) -> Result<()> {
        let now = Utc::now();
        let reset = self.inner.store.with(|db| match db.find_queue_entry(id)? {
            None => Ok(None),
            Some(entry) => {
                let reset = db.reset_for_retry(id, now)?;
                Ok(Some((entry, reset)))
            }
        })?;

        match reset {
            None => Err(self.missing(id)),
            Some((entry, false)) => Err(OutboxError::InvalidState {
                id,
                status: entry.status,
            }),
            Some((entry, true)) => {
                info!(msg_id = %id, "Retry requested");
                self.inner
                    .feed
                    .status(id, &entry.conversation_id, DeliveryStatus::Queued);
                self.kick();
                Ok(())
            }
        }
    }

    /// Drop a message that is not currently being sent.
    pub async fn discard(&self, id: Uuid) -> Result<()> {
        let retired = self.inner.store.with(|db| match db.find_queue_entry(id)? {
            None => Ok(None),
            Some(entry) if entry.status == DeliveryStatus::Sending => Ok(Some(Err(entry.status))),
            Some(_) => Ok(db.retire_entry(id, true)?.map(Ok)),
        })?;

        match retired {
            None => Err(self.missing(id)),
            Some(Err(status)) => Err(OutboxError::InvalidState { id, status }),
            Some(Ok(entry)) => {
                info!(msg_id = %id, "Message discarded");
                self.removed(&entry).await;
                Ok(())
            }
        }
    }

    /// Stop a message from being sent.  A delivered remote record is never
    /// taken back.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let result = self.inner.store.with(|db| match db.find_queue_entry(id)? {
            None => Ok(None),
            Some(entry) if entry.status == DeliveryStatus::Sending => {
                db.mark_cancelled(id)?;
                Ok(Some((entry, CancelOutcome::AfterCurrentAttempt)))
            }
            Some(entry) => {
                db.retire_entry(id, true)?;
                Ok(Some((entry, CancelOutcome::Removed)))
            }
        })?;

        let Some((entry, outcome)) = result else {
            return Err(self.missing(id));
        };

        info!(msg_id = %id, ?outcome, "Message cancelled");
        if outcome == CancelOutcome::Removed {
            self.removed(&entry).await;
        }
        Ok(outcome)
    }

    /// Cancel every pending message of one conversation.  Returns how many
    /// entries were affected.
    pub async fn cancel_conversation(&self, conversation_id: &ConversationId) -> Result<usize> {
        let entries = self
            .inner
            .store
            .with(|db| db.list_queue_entries_for_conversation(conversation_id))?;

        let mut affected = 0;
        for entry in entries {
            match self.cancel(entry.id).await {
                Ok(_) => affected += 1,
                // Finished between listing and cancelling.
                Err(OutboxError::NotFound(_)) | Err(OutboxError::InvalidState { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Read views
    // ------------------------------------------------------------------

    /// Pending entries of one conversation, oldest first.
    pub fn snapshot(&self, conversation_id: &ConversationId) -> Result<Vec<QueueEntry>> {
        self.inner
            .store
            .with(|db| db.list_queue_entries_for_conversation(conversation_id))
    }

    /// Every pending entry, oldest first.
    pub fn pending(&self) -> Result<Vec<QueueEntry>> {
        self.inner.store.with(|db| db.list_queue_entries())
    }

    pub fn depth(&self) -> Result<Vec<(DeliveryStatus, u32)>> {
        self.inner.store.with(|db| db.queue_depth())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// `NotFound`, or `InvalidState` if the message exists but already left
    /// the queue.
    fn missing(&self, id: Uuid) -> OutboxError {
        match self.inner.store.with(|db| db.get_message(id)) {
            Ok(message) => OutboxError::InvalidState {
                id,
                status: message.delivery_status,
            },
            Err(_) => OutboxError::NotFound(id),
        }
    }

    async fn removed(&self, entry: &QueueEntry) {
        release_blob(&self.inner, entry).await;
        self.inner.feed.publish(DeliveryEvent::Removed {
            message_id: entry.id,
            conversation_id: entry.conversation_id.clone(),
        });
    }
}

fn validate_payload(payload: &Payload) -> Result<()> {
    match payload {
        Payload::Text { content } => {
            if content.trim().is_empty() {
                return Err(OutboxError::InvalidPayload("empty message".into()));
            }
            if content.len() > MAX_TEXT_SIZE {
                return Err(OutboxError::InvalidPayload(format!(
                    "message is {} bytes (max {MAX_TEXT_SIZE})",
                    content.len()
                )));
            }
        }
        Payload::Image { width, height, .. } => {
            if *width == 0 || *height == 0 {
                return Err(OutboxError::InvalidPayload(
                    "image dimensions must be non-zero".into(),
                ));
            }
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Send attempt
// ----------------------------------------------------------------------

async fn run_attempt(inner: Arc<Inner>, entry: QueueEntry, _permit: OwnedSemaphorePermit) -> Outcome {
    let attempt = entry.attempt_count + 1;
    debug!(msg_id = %entry.id, attempt, "Sending");

    let result = match tokio::time::timeout(inner.config.send_timeout, send(&inner, &entry)).await
    {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Transient("send timed out".into())),
    };

    match result {
        Ok(remote_ref) => finish_delivered(&inner, &entry, remote_ref).await,
        Err(e) => finish_failed(&inner, &entry, e).await,
    }
}

/// Upload (if needed) and create.  Returns the remote blob reference of an
/// image message.
async fn send(inner: &Inner, entry: &QueueEntry) -> std::result::Result<Option<String>, RemoteError> {
    let (body, remote_ref) = match &entry.payload {
        Payload::Text { content } => (
            RemoteBody::Text {
                content: content.clone(),
            },
            None,
        ),
        Payload::Image {
            local_ref,
            width,
            height,
        } => {
            let url = match &entry.uploaded_ref {
                Some(url) => url.clone(),
                None => upload(inner, entry.id, *local_ref).await?,
            };
            (
                RemoteBody::Image {
                    url: url.clone(),
                    width: *width,
                    height: *height,
                },
                Some(url),
            )
        }
    };

    let message = RemoteMessage {
        id: entry.id,
        conversation_id: entry.conversation_id.clone(),
        sender_id: entry.sender_id.clone(),
        created_at: entry.created_at,
        body,
    };
    inner.remote.create(&message).await?;
    Ok(remote_ref)
}

async fn upload(inner: &Inner, id: Uuid, local_ref: Uuid) -> std::result::Result<String, RemoteError> {
    let bytes = inner.blobs.load(local_ref).await.map_err(|e| match e {
        BlobError::NotFound(_) => RemoteError::Permanent(format!("local image {local_ref} is missing")),
        other => RemoteError::Transient(other.to_string()),
    })?;

    let url = inner.remote.upload_blob(bytes).await?;

    // Persisted before `create` so a retry after a crash skips the upload.
    match inner.store.with(|db| db.record_upload(id, &url)) {
        Ok(true) => debug!(msg_id = %id, url = %url, "Upload recorded"),
        Ok(false) => warn!(msg_id = %id, "Entry no longer claimed, upload not recorded"),
        Err(e) => warn!(msg_id = %id, error = %e, "Failed to record upload"),
    }
    Ok(url)
}

async fn finish_delivered(inner: &Inner, entry: &QueueEntry, remote_ref: Option<String>) -> Outcome {
    match inner
        .store
        .with(|db| db.complete_delivery(entry.id, remote_ref.as_deref()))
    {
        Ok(retired) => {
            info!(msg_id = %entry.id, "Message delivered");
            if let Some(retired) = retired {
                release_blob(inner, &retired).await;
            }
            inner
                .feed
                .status(entry.id, &entry.conversation_id, DeliveryStatus::Delivered);
            Outcome::Delivered
        }
        Err(e) => {
            // `create` is idempotent, so the next attempt records it.
            error!(msg_id = %entry.id, error = %e, "Delivered but failed to record it");
            release_claim(inner, entry);
            Outcome::Unresolved
        }
    }
}

enum FailureAction {
    Gone,
    Cancelled(QueueEntry),
    Retry { attempts: u32 },
    GiveUp { attempts: u32 },
}

async fn finish_failed(inner: &Inner, entry: &QueueEntry, err: RemoteError) -> Outcome {
    let reason = err.to_string();
    let now = Utc::now();
    let scheduler = &inner.scheduler;

    // Read-decide-write under one lock so a concurrent cancel is never lost.
    let action = inner.store.with(|db| {
        let Some(current) = db.find_queue_entry(entry.id)? else {
            return Ok(FailureAction::Gone);
        };
        if current.cancelled {
            db.retire_entry(entry.id, true)?;
            return Ok(FailureAction::Cancelled(current));
        }

        let attempts = current.attempt_count + 1;
        if !err.is_transient() || scheduler.exhausted(attempts) {
            db.mark_permanently_failed(entry.id, attempts, &reason)?;
            Ok(FailureAction::GiveUp { attempts })
        } else {
            let next = scheduler.next_eligible_at(attempts, now);
            db.schedule_retry(entry.id, attempts, next, &reason)?;
            Ok(FailureAction::Retry { attempts })
        }
    });

    match action {
        Ok(FailureAction::Gone) => Outcome::Unresolved,
        Ok(FailureAction::Cancelled(current)) => {
            info!(msg_id = %entry.id, error = %reason, "Cancelled message failed, removed");
            release_blob(inner, &current).await;
            inner.feed.publish(DeliveryEvent::Removed {
                message_id: entry.id,
                conversation_id: entry.conversation_id.clone(),
            });
            Outcome::Cancelled
        }
        Ok(FailureAction::Retry { attempts }) => {
            warn!(msg_id = %entry.id, attempt = attempts, error = %reason, "Send failed, will retry");
            inner
                .feed
                .status(entry.id, &entry.conversation_id, DeliveryStatus::Failed);
            Outcome::Retried
        }
        Ok(FailureAction::GiveUp { attempts }) => {
            warn!(msg_id = %entry.id, attempt = attempts, error = %reason, "Send failed permanently");
            inner.feed.status(
                entry.id,
                &entry.conversation_id,
                DeliveryStatus::PermanentlyFailed,
            );
            Outcome::PermanentlyFailed
        }
        Err(e) => {
            error!(msg_id = %entry.id, error = %e, "Failed to record send failure");
            release_claim(inner, entry);
            Outcome::Unresolved
        }
    }
}

/// Hand an unresolved claim back to the queue after the backoff for the
/// attempt just made.  If this write fails too the entry stays `sending`
/// until startup recovery.
fn release_claim(inner: &Inner, entry: &QueueEntry) {
    let next = inner
        .scheduler
        .next_eligible_at(entry.attempt_count + 1, Utc::now());
    match inner.store.with(|db| db.requeue(entry.id, next)) {
        Ok(_) => debug!(msg_id = %entry.id, "Claim released"),
        Err(e) => error!(msg_id = %entry.id, error = %e, "Failed to release claim"),
    }
}

async fn release_blob(inner: &Inner, entry: &QueueEntry) {
    if let Some(local_ref) = entry.payload.local_blob() {
        if let Err(e) = inner.blobs.delete(local_ref).await {
            warn!(msg_id = %entry.id, blob = %local_ref, error = %e, "Failed to release blob");
        }
    }
}
