//! Domain model structs persisted in the local SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the UI layer.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

// ---------------------------------------------------------------------------
// Delivery status
// ---------------------------------------------------------------------------

/// Delivery state shared by queue entries and their mirrored messages.
///
/// Queue entries only ever hold `Queued`, `Sending`, `Failed` or
/// `PermanentlyFailed`: a delivered entry is retired from the queue and only
/// its message keeps the `Delivered` status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Queued,
    Sending,
    Delivered,
    Failed,
    PermanentlyFailed,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sending => "sending",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sending" => Ok(Self::Sending),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(format!("unknown delivery status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// What a message carries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Text {
        content: String,
    },
    Image {
        /// Reference into the local blob store.
        local_ref: Uuid,
        width: u32,
        height: u32,
    },
}

impl Payload {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn image(local_ref: Uuid, width: u32, height: u32) -> Self {
        Self::Image {
            local_ref,
            width,
            height,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
        }
    }

    /// Local blob backing this payload, if any.
    pub fn local_blob(&self) -> Option<Uuid> {
        match self {
            Self::Image { local_ref, .. } => Some(*local_ref),
            Self::Text { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// QueueEntry
// ---------------------------------------------------------------------------

/// One pending outbound unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueEntry {
    /// Client-generated id; doubles as the remote document id.
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub payload: Payload,
    /// Remote blob reference obtained by a successful upload.  Once set,
    /// further attempts go straight to `create`.
    pub uploaded_ref: Option<String>,
    /// Device clock at enqueue time.
    pub created_at: DateTime<Utc>,
    pub attempt_count: u32,
    /// The scheduler must not retry before this instant.
    pub next_eligible_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    /// Set when the user cancelled while an attempt was in flight.
    pub cancelled: bool,
    pub last_error: Option<String>,
}

impl QueueEntry {
    /// A fresh entry with a newly generated id, eligible immediately.
    pub fn new(conversation_id: ConversationId, sender_id: UserId, payload: Payload) -> Self {
        // Stored timestamps keep millisecond precision.
        let now = Utc::now().trunc_subsecs(3);
        Self {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            payload,
            uploaded_ref: None,
            created_at: now,
            attempt_count: 0,
            next_eligible_at: now,
            status: DeliveryStatus::Queued,
            cancelled: false,
            last_error: None,
        }
    }

    /// The user-facing mirror of this entry.
    pub fn to_message(&self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            payload: self.payload.clone(),
            remote_ref: None,
            created_at: self.created_at,
            delivery_status: self.status,
        }
    }
}

// ---------------------------------------------------------------------------
// MessageRecord
// ---------------------------------------------------------------------------

/// One chat message as displayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub payload: Payload,
    /// Remote location of the uploaded image once delivered.
    pub remote_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            DeliveryStatus::Queued,
            DeliveryStatus::Sending,
            DeliveryStatus::Delivered,
            DeliveryStatus::Failed,
            DeliveryStatus::PermanentlyFailed,
        ] {
            assert_eq!(status.as_str().parse::<DeliveryStatus>().unwrap(), status);
        }
        assert!("archived".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn payload_json_is_tagged() {
        let json = serde_json::to_value(Payload::text("hi")).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn new_entry_is_queued_and_eligible() {
        let entry = QueueEntry::new(
            ConversationId::new("c"),
            UserId::new("u"),
            Payload::text("hello"),
        );
        assert_eq!(entry.status, DeliveryStatus::Queued);
        assert_eq!(entry.attempt_count, 0);
        assert_eq!(entry.next_eligible_at, entry.created_at);
        assert_eq!(entry.to_message().delivery_status, DeliveryStatus::Queued);
    }
}
