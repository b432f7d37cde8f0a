//! The remote message store, as seen by the outbox.
//!
//! The store is an opaque durable service with per-document
//! create / exists semantics keyed by the client-chosen message id.  `create`
//! must be idempotent: calling it twice with the same id never yields two
//! remote records.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

pub use http::HttpRemoteSync;
pub use memory::MemoryRemote;

/// Outcome of a failed remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network error, timeout, overload.  Worth retrying.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// Unauthorized, invalid payload.  Retrying cannot help.
    #[error("remote rejected the request: {0}")]
    Permanent(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Body of a remote message document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteBody {
    Text { content: String },
    Image { url: String, width: u32, height: u32 },
}

/// The document `create` writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub created_at: DateTime<Utc>,
    pub body: RemoteBody,
}

/// Capability the outbox needs from the remote store.
#[async_trait]
pub trait RemoteSyncClient: Send + Sync + 'static {
    /// Create the document `message.id`.  Creating an id that already exists
    /// succeeds without writing a second record.
    async fn create(&self, message: &RemoteMessage) -> Result<(), RemoteError>;

    /// Whether a document with this id exists remotely.
    async fn exists(&self, id: Uuid) -> Result<bool, RemoteError>;

    /// Upload blob bytes, returning the reference `create` should point at.
    async fn upload_blob(&self, bytes: Bytes) -> Result<String, RemoteError>;
}
