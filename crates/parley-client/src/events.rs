//! Delivery feed observed by the UI layer.
//!
//! Every status change the outbox persists is published here after the
//! write commits.  A subscriber that falls behind receives
//! [`DeliveryEvent::Resync`] and should re-read its conversation from the
//! store.

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use parley_shared::ConversationId;
use parley_store::DeliveryStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryEvent {
    StatusChanged {
        message_id: Uuid,
        conversation_id: ConversationId,
        status: DeliveryStatus,
    },
    /// Cancelled or discarded before delivery; the message is gone.
    Removed {
        message_id: Uuid,
        conversation_id: ConversationId,
    },
    /// Startup could not determine whether the message reached the remote
    /// store; it was put back in the queue.
    RecoveryDeferred {
        message_id: Uuid,
        conversation_id: ConversationId,
        reason: String,
    },
    /// Events were dropped for this subscriber.
    Resync {
        conversation_id: Option<ConversationId>,
    },
}

impl DeliveryEvent {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::StatusChanged {
                conversation_id, ..
            }
            | Self::Removed {
                conversation_id, ..
            }
            | Self::RecoveryDeferred {
                conversation_id, ..
            } => Some(conversation_id),
            Self::Resync { conversation_id } => conversation_id.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct DeliveryFeed {
    tx: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryFeed {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: DeliveryEvent) {
        tracing::trace!(?event, "Delivery event");
        // Nobody listening is not an error.
        let _ = self.tx.send(event);
    }

    pub(crate) fn status(
        &self,
        message_id: Uuid,
        conversation_id: &ConversationId,
        status: DeliveryStatus,
    ) {
        self.publish(DeliveryEvent::StatusChanged {
            message_id,
            conversation_id: conversation_id.clone(),
            status,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_conversation(&self, conversation_id: ConversationId) -> ConversationWatch {
        ConversationWatch {
            conversation_id,
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for DeliveryFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Events of one conversation.
pub struct ConversationWatch {
    conversation_id: ConversationId,
    rx: broadcast::Receiver<DeliveryEvent>,
}

impl ConversationWatch {
    /// Next event for this conversation; `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<DeliveryEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.conversation_id() == Some(&self.conversation_id) => {
                    return Some(event)
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, conversation = %self.conversation_id, "Feed lagged");
                    return Some(DeliveryEvent::Resync {
                        conversation_id: Some(self.conversation_id.clone()),
                    });
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = DeliveryEvent> {
        futures::stream::unfold(self, |mut watch| async move {
            watch.recv().await.map(|event| (event, watch))
        })
    }
}
