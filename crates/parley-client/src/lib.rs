//! # parley-client
//!
//! Reliable outbound delivery for the Parley chat client.
//!
//! Messages are persisted locally first and then pushed to the remote store
//! by [`MessageQueueService`].  [`CrashRecoveryService`] reconciles anything a
//! previous process left half-sent before the first drain, and
//! [`NetworkMonitor`] turns connectivity changes into flushes.  [`Outbox`]
//! wires them together.

pub mod auth;
pub mod blobs;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod queue;
pub mod recovery;
pub mod remote;
pub mod runtime;
pub mod scheduler;
pub mod store;

use tracing_subscriber::{fmt, EnvFilter};

pub use auth::{AuthContext, StaticAuth};
pub use blobs::{BlobError, FsBlobStore, LocalBlobStore};
pub use config::OutboxConfig;
pub use error::{OutboxError, Result};
pub use events::{ConversationWatch, DeliveryEvent, DeliveryFeed};
pub use network::{ConnectivityEvent, NetworkMonitor, ReachabilityProbe, TcpProbe};
pub use queue::{CancelOutcome, Collaborators, DrainReport, MessageQueueService};
pub use recovery::{CrashRecoveryService, RecoveryReport};
pub use remote::{HttpRemoteSync, MemoryRemote, RemoteError, RemoteSyncClient};
pub use runtime::Outbox;
pub use scheduler::RetryScheduler;
pub use store::LocalStore;

/// Install the global `tracing` subscriber.  `RUST_LOG` overrides the
/// default filter.  Calling it twice is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,parley_client=debug"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
