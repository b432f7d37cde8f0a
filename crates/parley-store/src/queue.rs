//! Durable outbound queue operations.
//!
//! Every transition that changes a queue entry's status also mirrors the new
//! status onto the entry's [`MessageRecord`](crate::MessageRecord) inside the
//! same transaction.  Transitions out of `sending` are guarded by
//! `WHERE status = 'sending'`, so only the worker holding the claim can apply
//! an outcome.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use parley_shared::{ConversationId, UserId};

use crate::database::{fmt_ts, parse_ts, parse_uuid, Database};
use crate::error::{Result, StoreError};
use crate::messages::{insert_message, parse_payload, parse_status, set_delivery_status};
use crate::models::{DeliveryStatus, QueueEntry};

const ENTRY_COLUMNS: &str = "id, conversation_id, sender_id, payload, uploaded_ref, created_at,
     attempt_count, next_eligible_at, status, cancelled, last_error";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Persist a new entry together with its mirrored message.
    ///
    /// Fails with [`StoreError::Duplicate`] if the id is already known, either
    /// as a pending entry or as a message (delivered or not).
    pub fn enqueue_entry(&mut self, entry: &QueueEntry) -> Result<()> {
        let tx = self.conn_mut().transaction()?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE id = ?1)
                 OR EXISTS(SELECT 1 FROM queue_entries WHERE id = ?1)",
            params![entry.id.to_string()],
            |row| row.get(0),
        )?;
        if taken {
            return Err(StoreError::Duplicate(entry.id));
        }

        insert_message(&tx, &entry.to_message())?;
        tx.execute(
            "INSERT INTO queue_entries
                 (id, conversation_id, sender_id, payload, uploaded_ref, created_at,
                  attempt_count, next_eligible_at, status, cancelled, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                entry.id.to_string(),
                entry.conversation_id.as_str(),
                entry.sender_id.as_str(),
                serde_json::to_string(&entry.payload)?,
                entry.uploaded_ref,
                fmt_ts(&entry.created_at),
                entry.attempt_count,
                fmt_ts(&entry.next_eligible_at),
                entry.status.as_str(),
                entry.cancelled as i32,
                entry.last_error,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_queue_entry(&self, id: Uuid) -> Result<QueueEntry> {
        self.find_queue_entry(id)?.ok_or(StoreError::NotFound)
    }

    pub fn find_queue_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
        let entry = self
            .conn()
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
                row_to_entry,
            )
            .optional()?;
        Ok(entry)
    }

    /// Every pending entry, oldest first.
    pub fn list_queue_entries(&self) -> Result<Vec<QueueEntry>> {
        self.query_entries(
            &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries ORDER BY created_at ASC"),
            [],
        )
    }

    pub fn list_queue_entries_for_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<QueueEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries
                 WHERE conversation_id = ?1
                 ORDER BY created_at ASC"
            ),
            params![conversation_id.as_str()],
        )
    }

    /// Entries a drain pass may attempt at `now`, oldest first.
    pub fn list_eligible(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<QueueEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries
                 WHERE status IN ('queued', 'failed')
                   AND cancelled = 0
                   AND next_eligible_at <= ?1
                 ORDER BY created_at ASC
                 LIMIT ?2"
            ),
            params![fmt_ts(&now), limit],
        )
    }

    /// Entries whose delivery outcome is unknown at startup: anything left in
    /// `sending`, plus queued/failed entries created before `stale_before`.
    pub fn list_recovery_candidates(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>> {
        self.query_entries(
            &format!(
                "SELECT {ENTRY_COLUMNS} FROM queue_entries
                 WHERE status = 'sending'
                    OR (status IN ('queued', 'failed') AND created_at < ?1)
                 ORDER BY created_at ASC"
            ),
            params![fmt_ts(&stale_before)],
        )
    }

    /// Number of pending entries per status.
    pub fn queue_depth(&self) -> Result<Vec<(DeliveryStatus, u32)>> {
        let mut stmt = self.conn().prepare(
            "SELECT status, COUNT(*) FROM queue_entries GROUP BY status ORDER BY status",
        )?;
        let rows = stmt.query_map([], |row| {
            let status: String = row.get(0)?;
            Ok((parse_status(0, &status)?, row.get(1)?))
        })?;

        let mut depth = Vec::new();
        for row in rows {
            depth.push(row?);
        }
        Ok(depth)
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Atomically move an eligible entry to `sending`.
    ///
    /// Returns `false` if another worker claimed it first, or it is no longer
    /// eligible (cancelled, backing off, terminal, retired).
    pub fn claim_entry(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let affected = tx.execute(
            "UPDATE queue_entries SET status = 'sending'
             WHERE id = ?1
               AND status IN ('queued', 'failed')
               AND cancelled = 0
               AND next_eligible_at <= ?2",
            params![id.to_string(), fmt_ts(&now)],
        )?;
        if affected == 1 {
            set_delivery_status(&tx, id, DeliveryStatus::Sending)?;
        }
        tx.commit()?;
        Ok(affected == 1)
    }

    /// Remember the remote reference of a finished upload so later attempts
    /// skip straight to `create`.
    pub fn record_upload(&self, id: Uuid, remote_ref: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE queue_entries SET uploaded_ref = ?1 WHERE id = ?2 AND status = 'sending'",
            params![remote_ref, id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Retire a delivered entry and mark its message `delivered`.
    ///
    /// Returns the retired entry (so the caller can release its local blob),
    /// or `None` if the entry was already gone; the message is updated either
    /// way.
    pub fn complete_delivery(
        &mut self,
        id: Uuid,
        remote_ref: Option<&str>,
    ) -> Result<Option<QueueEntry>> {
        let tx = self.conn_mut().transaction()?;

        let entry = tx
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
                row_to_entry,
            )
            .optional()?;

        tx.execute(
            "DELETE FROM queue_entries WHERE id = ?1",
            params![id.to_string()],
        )?;
        tx.execute(
            "UPDATE messages
             SET delivery_status = 'delivered', remote_ref = COALESCE(?1, remote_ref)
             WHERE id = ?2",
            params![remote_ref, id.to_string()],
        )?;

        tx.commit()?;
        Ok(entry)
    }

    /// Record a transient failure of the claimed attempt.
    pub fn schedule_retry(
        &mut self,
        id: Uuid,
        attempt_count: u32,
        next_eligible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let affected = tx.execute(
            "UPDATE queue_entries
             SET status = 'failed', attempt_count = ?1, next_eligible_at = ?2, last_error = ?3
             WHERE id = ?4 AND status = 'sending'",
            params![attempt_count, fmt_ts(&next_eligible_at), error, id.to_string()],
        )?;
        if affected == 1 {
            set_delivery_status(&tx, id, DeliveryStatus::Failed)?;
        }
        tx.commit()?;
        Ok(affected == 1)
    }

    /// Take the claimed entry out of automatic draining for good.
    pub fn mark_permanently_failed(
        &mut self,
        id: Uuid,
        attempt_count: u32,
        error: &str,
    ) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let affected = tx.execute(
            "UPDATE queue_entries
             SET status = 'permanently_failed', attempt_count = ?1, last_error = ?2
             WHERE id = ?3 AND status = 'sending'",
            params![attempt_count, error, id.to_string()],
        )?;
        if affected == 1 {
            set_delivery_status(&tx, id, DeliveryStatus::PermanentlyFailed)?;
        }
        tx.commit()?;
        Ok(affected == 1)
    }

    /// Put an entry back to `queued` without touching its attempt count.
    /// Used by crash recovery, and by a drain that could not record how an
    /// attempt ended.
    pub fn requeue(&mut self, id: Uuid, next_eligible_at: DateTime<Utc>) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let affected = tx.execute(
            "UPDATE queue_entries SET status = 'queued', next_eligible_at = ?1
             WHERE id = ?2 AND status IN ('sending', 'queued', 'failed')",
            params![fmt_ts(&next_eligible_at), id.to_string()],
        )?;
        if affected == 1 {
            set_delivery_status(&tx, id, DeliveryStatus::Queued)?;
        }
        tx.commit()?;
        Ok(affected == 1)
    }

    /// User-initiated "try again": a failed entry starts over with a fresh
    /// attempt budget.
    pub fn reset_for_retry(&mut self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let tx = self.conn_mut().transaction()?;
        let affected = tx.execute(
            "UPDATE queue_entries
             SET status = 'queued', attempt_count = 0, next_eligible_at = ?1,
                 last_error = NULL, cancelled = 0
             WHERE id = ?2 AND status IN ('failed', 'permanently_failed')",
            params![fmt_ts(&now), id.to_string()],
        )?;
        if affected == 1 {
            set_delivery_status(&tx, id, DeliveryStatus::Queued)?;
        }
        tx.commit()?;
        Ok(affected == 1)
    }

    /// Flag an in-flight entry so its attempt finishes but nothing follows.
    pub fn mark_cancelled(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "UPDATE queue_entries SET cancelled = 1 WHERE id = ?1 AND status = 'sending'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Remove an entry from the queue.  With `drop_message` the never-delivered
    /// message disappears as well.  Returns the retired entry, if any.
    pub fn retire_entry(&mut self, id: Uuid, drop_message: bool) -> Result<Option<QueueEntry>> {
        let tx = self.conn_mut().transaction()?;

        let entry = tx
            .query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
                params![id.to_string()],
                row_to_entry,
            )
            .optional()?;

        if entry.is_some() {
            tx.execute(
                "DELETE FROM queue_entries WHERE id = ?1",
                params![id.to_string()],
            )?;
            if drop_message {
                tx.execute(
                    "DELETE FROM messages WHERE id = ?1 AND delivery_status != 'delivered'",
                    params![id.to_string()],
                )?;
            }
        }

        tx.commit()?;
        Ok(entry)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn query_entries<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<QueueEntry>> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// Map a `rusqlite::Row` to a [`QueueEntry`].
fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
    let id_str: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let payload_json: String = row.get(3)?;
    let uploaded_ref: Option<String> = row.get(4)?;
    let created_str: String = row.get(5)?;
    let attempt_count: u32 = row.get(6)?;
    let eligible_str: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let cancelled_int: i32 = row.get(9)?;
    let last_error: Option<String> = row.get(10)?;

    Ok(QueueEntry {
        id: parse_uuid(0, &id_str)?,
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(sender_id),
        payload: parse_payload(3, &payload_json)?,
        uploaded_ref,
        created_at: parse_ts(5, &created_str)?,
        attempt_count,
        next_eligible_at: parse_ts(7, &eligible_str)?,
        status: parse_status(8, &status_str)?,
        cancelled: cancelled_int != 0,
        last_error,
    })
}
