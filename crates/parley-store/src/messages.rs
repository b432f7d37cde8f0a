//! Read access to [`MessageRecord`] rows.
//!
//! `delivery_status` is only ever written by the queue transitions in
//! [`crate::queue`]; this module exposes no way to set it directly.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

use crate::database::{parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::models::{DeliveryStatus, MessageRecord, Payload};

const MESSAGE_COLUMNS: &str =
    "id, conversation_id, sender_id, payload, remote_ref, created_at, delivery_status";

impl Database {
    pub fn get_message(&self, id: Uuid) -> Result<MessageRecord> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id.to_string()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn message_exists(&self, id: Uuid) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM messages WHERE id = ?1",
                params![id.to_string()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }
}

pub(crate) fn insert_message(conn: &rusqlite::Connection, message: &MessageRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO messages
             (id, conversation_id, sender_id, payload, remote_ref, created_at, delivery_status)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            message.id.to_string(),
            message.conversation_id.as_str(),
            message.sender_id.as_str(),
            serde_json::to_string(&message.payload)?,
            message.remote_ref,
            crate::database::fmt_ts(&message.created_at),
            message.delivery_status.as_str(),
        ],
    )?;
    Ok(())
}

pub(crate) fn set_delivery_status(
    conn: &rusqlite::Connection,
    id: Uuid,
    status: DeliveryStatus,
) -> Result<()> {
    conn.execute(
        "UPDATE messages SET delivery_status = ?1 WHERE id = ?2",
        params![status.as_str(), id.to_string()],
    )?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let payload_json: String = row.get(3)?;
    let remote_ref: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let status_str: String = row.get(6)?;

    Ok(MessageRecord {
        id: parse_uuid(0, &id_str)?,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        payload: parse_payload(3, &payload_json)?,
        remote_ref,
        created_at: parse_ts(5, &created_str)?,
        delivery_status: parse_status(6, &status_str)?,
    })
}

pub(crate) fn parse_payload(idx: usize, json: &str) -> rusqlite::Result<Payload> {
    serde_json::from_str(json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn parse_status(idx: usize, s: &str) -> rusqlite::Result<DeliveryStatus> {
    s.parse::<DeliveryStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}
