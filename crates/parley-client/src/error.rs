use thiserror::Error;
use uuid::Uuid;

use parley_store::{DeliveryStatus, StoreError};

use crate::blobs::BlobError;

/// Errors surfaced by the delivery core to its callers.
///
/// Send failures never appear here: transient ones are absorbed by the retry
/// loop and permanent ones are recorded on the entry and broadcast on the
/// delivery feed.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// The local store could not persist or read state.  Fatal to the calling
    /// operation; an enqueue that returns this did not queue anything.
    #[error("Local persistence failure: {0}")]
    LocalPersistence(StoreError),

    #[error("Message {0} is already queued or delivered")]
    DuplicateEntry(Uuid),

    #[error("No queue entry for message {0}")]
    NotFound(Uuid),

    #[error("Message {id} is {status}, operation not allowed")]
    InvalidState { id: Uuid, status: DeliveryStatus },

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Local blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Local store lock poisoned")]
    LockPoisoned,
}

impl From<StoreError> for OutboxError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate(id) => OutboxError::DuplicateEntry(id),
            other => OutboxError::LocalPersistence(other),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OutboxError>;
