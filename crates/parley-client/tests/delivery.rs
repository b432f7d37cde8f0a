//! End-to-end delivery scenarios: offline queues, restarts, crashes mid-send,
//! resumable image uploads and the retry ceiling.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use parley_client::remote::{RemoteBody, RemoteMessage};
use parley_client::{
    Collaborators, DeliveryFeed, FsBlobStore, LocalStore, MemoryRemote, MessageQueueService,
    NetworkMonitor, Outbox, OutboxConfig, RemoteError, RemoteSyncClient, StaticAuth,
};
use parley_shared::{ConnectivityState, ConversationId, UserId};
use parley_store::{DeliveryStatus, Payload, QueueEntry};

fn config() -> OutboxConfig {
    OutboxConfig {
        max_in_flight: 2,
        max_attempts: 3,
        backoff_base: Duration::ZERO,
        backoff_cap: Duration::ZERO,
        backoff_jitter: Duration::ZERO,
        send_timeout: Duration::from_secs(5),
        wake_interval: Duration::from_millis(50),
        recovery_timeout: Duration::from_secs(5),
        ..OutboxConfig::default()
    }
}

async fn deps(
    dir: &Path,
    remote: Arc<dyn RemoteSyncClient>,
    network: NetworkMonitor,
) -> Collaborators {
    Collaborators {
        store: LocalStore::open_at(&dir.join("parley.db")).unwrap(),
        remote,
        blobs: Arc::new(
            FsBlobStore::new(dir.join("blobs"), 1 << 20)
                .await
                .unwrap(),
        ),
        auth: Arc::new(StaticAuth::new("alice")),
        network,
    }
}

fn conversation() -> ConversationId {
    ConversationId::direct(&UserId::new("alice"), &UserId::new("bob"))
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn status(store: &LocalStore, id: Uuid) -> DeliveryStatus {
    store.with(|db| db.get_message(id)).unwrap().delivery_status
}

/// Leave an entry exactly as a process killed mid-send would.
fn crashed_mid_send(store: &LocalStore, content: &str) -> QueueEntry {
    let entry = QueueEntry::new(conversation(), UserId::new("alice"), Payload::text(content));
    store
        .with(|db| {
            db.enqueue_entry(&entry)?;
            db.claim_entry(entry.id, Utc::now())
        })
        .unwrap();
    entry
}

#[tokio::test]
async fn offline_messages_flush_once_online() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Some(Duration::from_millis(30)));
    let network = NetworkMonitor::new(ConnectivityState::Offline);
    let deps = deps(dir.path(), remote.clone(), network.clone()).await;
    let store = deps.store.clone();

    let outbox = Outbox::start(config(), deps).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        let id = outbox
            .queue()
            .send_text(conversation(), format!("message {i}"))
            .await
            .unwrap();
        ids.push(id);
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(remote.total_create_calls(), 0);

    // A flap before settling online loses nothing.
    network.set_state(ConnectivityState::Online);
    network.set_state(ConnectivityState::Offline);
    network.set_state(ConnectivityState::Online);

    wait_until("all delivered", || remote.message_count() == 5).await;
    wait_until("queue empty", || {
        outbox.queue().pending().map(|p| p.is_empty()).unwrap_or(false)
    })
    .await;

    for id in &ids {
        assert_eq!(status(&store, *id), DeliveryStatus::Delivered);
        assert!(remote.create_calls(*id) >= 1);
    }
    assert!(remote.peak_in_flight() <= 2);

    outbox.shutdown().await;
}

#[tokio::test]
async fn queued_messages_survive_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());

    let id = {
        let network = NetworkMonitor::new(ConnectivityState::Offline);
        let outbox = Outbox::start(config(), deps(dir.path(), remote.clone(), network).await)
            .await
            .unwrap();
        let id = outbox.queue().send_text(conversation(), "persist me").await.unwrap();
        outbox.shutdown().await;
        id
    };

    let network = NetworkMonitor::new(ConnectivityState::Online);
    let outbox = Outbox::start(config(), deps(dir.path(), remote.clone(), network).await)
        .await
        .unwrap();

    wait_until("delivered after restart", || remote.contains(id)).await;
    assert_eq!(remote.create_calls(id), 1);
    outbox.shutdown().await;
}

#[tokio::test]
async fn create_that_landed_before_crash_is_not_resent() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let network = NetworkMonitor::new(ConnectivityState::Online);
    let deps = deps(dir.path(), remote.clone(), network).await;
    let store = deps.store.clone();

    let entry = crashed_mid_send(&store, "landed");
    remote.insert(RemoteMessage {
        id: entry.id,
        conversation_id: entry.conversation_id.clone(),
        sender_id: entry.sender_id.clone(),
        created_at: entry.created_at,
        body: RemoteBody::Text {
            content: "landed".into(),
        },
    });

    let outbox = Outbox::start(config(), deps).await.unwrap();
    assert_eq!(outbox.recovery_report().delivered, 1);
    assert_eq!(status(&store, entry.id), DeliveryStatus::Delivered);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(remote.create_calls(entry.id), 0);
    assert_eq!(remote.message_count(), 1);
    outbox.shutdown().await;
}

#[tokio::test]
async fn crash_before_create_is_sent_exactly_once() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let network = NetworkMonitor::new(ConnectivityState::Online);
    let deps = deps(dir.path(), remote.clone(), network).await;
    let store = deps.store.clone();

    let entry = crashed_mid_send(&store, "lost in flight");

    let outbox = Outbox::start(config(), deps).await.unwrap();
    assert_eq!(outbox.recovery_report().requeued, 1);

    wait_until("delivered", || status(&store, entry.id) == DeliveryStatus::Delivered).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(remote.create_calls(entry.id), 1);
    outbox.shutdown().await;
}

#[tokio::test]
async fn lost_create_response_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.push_create_fault(parley_client::remote::memory::CreateFault::LoseResponse);
    let network = NetworkMonitor::new(ConnectivityState::Online);

    let outbox = Outbox::start(config(), deps(dir.path(), remote.clone(), network).await)
        .await
        .unwrap();
    let id = outbox.queue().send_text(conversation(), "ack lost").await.unwrap();

    wait_until("delivered", || {
        outbox.queue().pending().map(|p| p.is_empty()).unwrap_or(false)
    })
    .await;
    assert_eq!(remote.message_count(), 1);
    assert_eq!(remote.create_calls(id), 2);
    outbox.shutdown().await;
}

/// Forwards to a [`MemoryRemote`] but never completes `create` while
/// `stall` is set.
struct StallingCreates {
    inner: Arc<MemoryRemote>,
    stall: AtomicBool,
}

#[async_trait]
impl RemoteSyncClient for StallingCreates {
    async fn create(&self, message: &RemoteMessage) -> Result<(), RemoteError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.create(message).await
    }

    async fn exists(&self, id: Uuid) -> Result<bool, RemoteError> {
        self.inner.exists(id).await
    }

    async fn upload_blob(&self, bytes: Bytes) -> Result<String, RemoteError> {
        self.inner.upload_blob(bytes).await
    }
}

#[tokio::test]
async fn image_upload_is_not_repeated_after_crash() {
    let dir = TempDir::new().unwrap();
    let memory = Arc::new(MemoryRemote::new());
    let remote = Arc::new(StallingCreates {
        inner: memory.clone(),
        stall: AtomicBool::new(true),
    });
    let network = NetworkMonitor::new(ConnectivityState::Online);

    // First process: upload succeeds, create never answers, process dies.
    let id = {
        let deps = deps(dir.path(), remote.clone(), network.clone()).await;
        let store = deps.store.clone();
        let queue = MessageQueueService::new(config(), deps, DeliveryFeed::default());
        queue.open_barrier();

        let id = queue
            .send_image(conversation(), Bytes::from_static(b"\xff\xd8jpeg"), 800, 600)
            .await
            .unwrap();

        let drainer = queue.clone();
        let drain = tokio::spawn(async move { drainer.drain().await });
        wait_until("upload recorded", || {
            store
                .with(|db| db.get_queue_entry(id))
                .map(|e| e.uploaded_ref.is_some())
                .unwrap_or(false)
        })
        .await;

        drain.abort();
        let _ = drain.await;
        assert_eq!(status(&store, id), DeliveryStatus::Sending);
        id
    };
    assert_eq!(memory.upload_calls(), 1);
    assert!(!memory.contains(id));

    // Second process.
    remote.stall.store(false, Ordering::SeqCst);
    let deps = deps(dir.path(), remote.clone(), network).await;
    let store = deps.store.clone();
    let outbox = Outbox::start(config(), deps).await.unwrap();
    assert_eq!(outbox.recovery_report().requeued, 1);

    wait_until("delivered", || status(&store, id) == DeliveryStatus::Delivered).await;
    assert_eq!(memory.upload_calls(), 1);
    assert_eq!(memory.blob_count(), 1);
    assert_eq!(memory.create_calls(id), 1);

    let message = store.with(|db| db.get_message(id)).unwrap();
    assert!(message.remote_ref.is_some());
    outbox.shutdown().await;
}

#[tokio::test]
async fn retry_ceiling_parks_the_entry() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.fail_next_creates(100);
    let network = NetworkMonitor::new(ConnectivityState::Online);
    let deps = deps(dir.path(), remote.clone(), network).await;
    let store = deps.store.clone();

    let queue = MessageQueueService::new(config(), deps, DeliveryFeed::default());
    queue.open_barrier();
    let id = queue.send_text(conversation(), "unlucky").await.unwrap();

    for _ in 0..3 {
        queue.drain().await.unwrap();
    }
    assert_eq!(status(&store, id), DeliveryStatus::PermanentlyFailed);

    for _ in 0..3 {
        assert_eq!(queue.drain().await.unwrap().claimed, 0);
    }
    assert_eq!(remote.create_calls(id), 3);

    let entry = store.with(|db| db.get_queue_entry(id)).unwrap();
    assert_eq!(entry.attempt_count, 3);
    assert!(entry.last_error.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drains_send_each_entry_once() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.set_latency(Some(Duration::from_millis(20)));
    let network = NetworkMonitor::new(ConnectivityState::Online);
    let deps = deps(dir.path(), remote.clone(), network).await;

    let queue = MessageQueueService::new(
        OutboxConfig {
            max_in_flight: 3,
            ..config()
        },
        deps,
        DeliveryFeed::default(),
    );
    queue.open_barrier();

    let mut ids = Vec::new();
    for i in 0..20 {
        ids.push(queue.send_text(conversation(), format!("n{i}")).await.unwrap());
    }

    let mut drains = Vec::new();
    for _ in 0..4 {
        let q = queue.clone();
        drains.push(tokio::spawn(async move { q.drain().await }));
    }

    let mut claimed = 0;
    for drain in drains {
        claimed += drain.await.unwrap().unwrap().claimed;
    }
    // Entries are only listed by one pass each or skipped by the losers.
    assert_eq!(claimed, 20);

    for id in ids {
        assert_eq!(remote.create_calls(id), 1);
    }
    assert!(remote.peak_in_flight() <= 3);
}
